use std::path::PathBuf;
use std::process::Output;

use bstr::ByteSlice;
use tokio::process::Command;

use crate::client::ClientFuture;
use crate::{SlurmError, SlurmResult};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            code: output.status.code(),
            stdout: output.stdout.to_str_lossy().into_owned(),
            stderr: output.stderr.to_str_lossy().into_owned(),
        }
    }
}

/// Executes Slurm tools, either locally or on a login node of the cluster.
pub trait CommandRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [String]) -> ClientFuture<'a, CommandOutput>;
}

/// Quotes `arg` for a POSIX shell, if needed.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-=,./:@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|arg| shell_quote(arg)))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn check_command_output(output: CommandOutput) -> SlurmResult<CommandOutput> {
    if !output.success {
        return Err(SlurmError::Transport(format!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            output.code.unwrap_or(-1),
            output.stderr.trim(),
            output.stdout.trim()
        )));
    }
    Ok(output)
}

/// Kind of a `sacctmgr` modification, it decides which answers count as already settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SacctmgrAction {
    Create,
    Delete,
    Modify,
}

impl SacctmgrAction {
    fn settled_messages(self) -> &'static [&'static str] {
        match self {
            SacctmgrAction::Create => &[],
            SacctmgrAction::Delete => &["Nothing deleted", "doesn't exist"],
            SacctmgrAction::Modify => &["Nothing modified"],
        }
    }
}

/// `sacctmgr` reports deleting something that is already gone, or setting a value that is
/// already set, with a message and sometimes a non-zero exit code. Such answers are not
/// failures. A create is never settled this way.
pub fn is_settled(action: SacctmgrAction, output: &CommandOutput) -> bool {
    action
        .settled_messages()
        .iter()
        .any(|message| output.stdout.contains(message) || output.stderr.contains(message))
}

async fn execute(mut command: Command, description: &str) -> SlurmResult<CommandOutput> {
    log::debug!("Running command `{description}`");
    let output = command
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|error| SlurmError::Transport(format!("Cannot start `{description}`: {error}")))?;
    Ok(output.into())
}

/// Runs the tools on the local machine.
#[derive(Default)]
pub struct LocalRunner;

impl CommandRunner for LocalRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [String]) -> ClientFuture<'a, CommandOutput> {
        Box::pin(async move {
            let mut command = Command::new(program);
            command.args(args);
            execute(command, &command_line(program, args)).await
        })
    }
}

/// Runs the tools on a remote host through `ssh` in batch mode.
#[derive(Clone, Debug)]
pub struct SshRunner {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity: Option<PathBuf>,
}

impl SshRunner {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            identity: None,
        }
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    pub fn ssh_args(&self, remote_command: String) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if let Some(port) = self.port {
            args.extend(["-p".to_string(), port.to_string()]);
        }
        if let Some(identity) = &self.identity {
            args.extend(["-i".to_string(), identity.display().to_string()]);
        }
        args.push(self.destination());
        args.push(remote_command);
        args
    }
}

impl CommandRunner for SshRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [String]) -> ClientFuture<'a, CommandOutput> {
        Box::pin(async move {
            let remote = command_line(program, args);
            let mut command = Command::new("ssh");
            command.args(self.ssh_args(remote.clone()));
            execute(command, &format!("ssh {}: {remote}", self.destination())).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CommandOutput, SacctmgrAction, SshRunner, check_command_output, command_line, is_settled,
        shell_quote,
    };
    use std::path::PathBuf;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("name=alice"), "name=alice");
        assert_eq!(shell_quote("DefaultAccount='root'"), r"'DefaultAccount='\''root'\'''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_command_line() {
        let args = vec!["-Q".to_string(), "dump".to_string(), "my cluster".to_string()];
        assert_eq!(command_line("sacctmgr", &args), "sacctmgr -Q dump 'my cluster'");
    }

    #[test]
    fn test_ssh_args() {
        let runner = SshRunner {
            host: "login.example.org".to_string(),
            user: Some("admin".to_string()),
            port: Some(2222),
            identity: Some(PathBuf::from("/etc/assocsync/id_ed25519")),
        };
        assert_eq!(
            runner.ssh_args("sacctmgr -Q dump c".to_string()),
            vec![
                "-o",
                "BatchMode=yes",
                "-p",
                "2222",
                "-i",
                "/etc/assocsync/id_ed25519",
                "admin@login.example.org",
                "sacctmgr -Q dump c"
            ]
        );
        assert_eq!(
            SshRunner::new("h").ssh_args("x".to_string()),
            vec!["-o", "BatchMode=yes", "h", "x"]
        );
    }

    #[test]
    fn test_check_failed_output() {
        let output = CommandOutput {
            success: false,
            code: Some(1),
            stdout: String::new(),
            stderr: "sacctmgr: error: Problem talking to the database\n".to_string(),
        };
        let error = check_command_output(output).unwrap_err();
        assert!(error.to_string().contains("Problem talking to the database"));
    }

    fn failed(stdout: &str) -> CommandOutput {
        CommandOutput {
            success: false,
            code: Some(1),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_settled_messages() {
        assert!(is_settled(SacctmgrAction::Delete, &failed(" Nothing deleted\n")));
        assert!(is_settled(SacctmgrAction::Modify, &failed(" Nothing modified\n")));
        assert!(!is_settled(SacctmgrAction::Delete, &CommandOutput::default()));
    }

    #[test]
    fn test_create_is_never_settled() {
        let output = failed(" Parent account lab9 doesn't exist.\n");
        assert!(!is_settled(SacctmgrAction::Create, &output));
        assert!(!is_settled(SacctmgrAction::Create, &failed(" Nothing new added.\n")));
        assert!(!is_settled(SacctmgrAction::Modify, &output));
    }
}
