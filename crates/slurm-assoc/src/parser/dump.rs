//! Reader and writer of the `sacctmgr dump` format.
//!
//! ```text
//! Cluster - 'name':Fairshare=1:QOS='normal'
//! Parent - 'root'
//! User - 'root':DefaultAccount='root':AdminLevel='Administrator'
//! Account - 'lab':Description='lab':Fairshare=100
//! Parent - 'lab'
//! User - 'alice':DefaultAccount='lab'
//! ```
//!
//! `User` and `Account` lines attach to the account named by the latest `Parent` line.
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Write;
use std::str::FromStr;

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::combinator::{map, rest};
use nom::sequence::{separated_pair, tuple};

use crate::error::parse_error;
use crate::model::{Account, Cluster, User};
use crate::parser::{NomResult, format_parse_error, p_quoted};
use crate::spec::{Spec, SpecSet};
use crate::{ROOT_ACCOUNT, SlurmError, SlurmResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Cluster,
    Parent,
    Account,
    User,
}

fn p_kind(input: &str) -> NomResult<LineKind> {
    alt((
        map(tag("Cluster"), |_| LineKind::Cluster),
        map(tag("Parent"), |_| LineKind::Parent),
        map(tag("Account"), |_| LineKind::Account),
        map(tag("User"), |_| LineKind::User),
    ))(input)
}

/// `<Kind> - '<name>'`, followed by the unparsed remainder of the line.
fn p_line(input: &str) -> NomResult<(LineKind, &str, &str)> {
    map(
        tuple((separated_pair(p_kind, tag(" - "), p_quoted), rest)),
        |((kind, name), remainder)| (kind, name, remainder),
    )(input)
}

/// Splits colon-joined specs, ignoring colons inside single quotes
/// (e.g. `Description='a:b'`).
fn split_specs(input: &str) -> SlurmResult<SpecSet> {
    let mut tokens = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (index, c) in input.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            ':' if !quoted => {
                tokens.push(&input[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    if quoted {
        return parse_error(format!("Unterminated quote in specs `{input}`"));
    }
    tokens.push(&input[start..]);
    tokens
        .into_iter()
        .filter(|token| !token.trim().is_empty())
        .map(Spec::from_str)
        .collect()
}

fn parse_specs(remainder: &str) -> SlurmResult<SpecSet> {
    let remainder = remainder.trim();
    if remainder.is_empty() {
        return Ok(SpecSet::new());
    }
    match remainder.strip_prefix(':') {
        Some(specs) => split_specs(specs),
        None => parse_error(format!("Expected `:` before specs, found `{remainder}`")),
    }
}

/// Parses a dump stream into a [`Cluster`] tree.
pub fn parse_dump(input: &str) -> SlurmResult<Cluster> {
    let mut cluster = Cluster::new("");
    let mut cluster_seen = false;
    let mut parent: Option<String> = None;

    for (index, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (kind, name, remainder) = match p_line(line) {
            Ok((_, parsed)) => parsed,
            Err(error) => {
                log::debug!(
                    "Skipping unrecognized dump line {}: {}",
                    index + 1,
                    format_parse_error(error)
                );
                continue;
            }
        };
        let context = |error: SlurmError| match error {
            SlurmError::Parse(message) => {
                SlurmError::Parse(format!("line {}: {message}", index + 1))
            }
            error => error,
        };

        match kind {
            LineKind::Cluster => {
                if cluster_seen {
                    return parse_error(format!(
                        "line {}: dump contains a second cluster `{name}`",
                        index + 1
                    ));
                }
                cluster_seen = true;
                cluster.name = name.to_string();
                cluster.specs = parse_specs(remainder).map_err(context)?;
            }
            LineKind::Parent => {
                if name == ROOT_ACCOUNT {
                    cluster.get_or_insert_account(ROOT_ACCOUNT);
                } else if cluster.account(name).is_none() {
                    return parse_error(format!(
                        "line {}: parent `{name}` was not declared as an account",
                        index + 1
                    ));
                }
                parent = Some(name.to_string());
            }
            LineKind::Account => {
                let mut account = Account::new(name);
                account.specs = parse_specs(remainder).map_err(context)?;
                account.parent = parent.clone().filter(|p| p != ROOT_ACCOUNT);
                cluster.add_account(account);
            }
            LineKind::User => {
                let Some(parent) = &parent else {
                    return parse_error(format!(
                        "line {}: user `{name}` appears before any `Parent` line",
                        index + 1
                    ));
                };
                let user = User::new(name).with_specs(parse_specs(remainder).map_err(context)?);
                cluster.get_or_insert_account(parent).add_user(user);
            }
        }
    }

    if cluster.name.is_empty() {
        return parse_error("Dump does not contain a named cluster".to_string());
    }
    Ok(cluster)
}

fn write_entity(
    output: &mut impl Write,
    kind: &str,
    name: &str,
    specs: &SpecSet,
) -> std::io::Result<()> {
    write!(output, "{kind} - '{name}'")?;
    if !specs.is_empty() {
        write!(output, ":{}", specs.join(":"))?;
    }
    writeln!(output)
}

/// Writes the users and child accounts of a single parent account.
fn write_group<'a>(
    cluster: &'a Cluster,
    name: &'a str,
    children: &BTreeMap<&'a str, Vec<&'a Account>>,
    visited: &mut BTreeSet<&'a str>,
    queue: &mut VecDeque<&'a str>,
    output: &mut impl Write,
) -> std::io::Result<()> {
    let users: Vec<&User> = cluster
        .account(name)
        .map(|account| account.users().collect())
        .unwrap_or_default();
    let group = children.get(name).map(|c| c.as_slice()).unwrap_or_default();
    if users.is_empty() && group.is_empty() {
        return Ok(());
    }

    writeln!(output, "Parent - '{name}'")?;
    for user in users {
        write_entity(output, "User", &user.name, &user.specs)?;
    }
    for account in group {
        if visited.insert(account.name.as_str()) {
            write_entity(output, "Account", &account.name, &account.specs)?;
            queue.push_back(account.name.as_str());
        }
    }
    Ok(())
}

/// Writes the tree in the dump format, so that [`parse_dump`] reads back the same tree.
///
/// Accounts are grouped under their parents, starting from root. Accounts whose parent is unknown
/// are written under root. A tree without a root account that has any account or user is read
/// back with a synthetic root, since every dump group starts with a `Parent` line.
pub fn write_dump(cluster: &Cluster, output: &mut impl Write) -> std::io::Result<()> {
    write_entity(output, "Cluster", &cluster.name, &cluster.specs)?;

    let known: BTreeSet<&str> = cluster.accounts().map(|a| a.name.as_str()).collect();
    let mut children: BTreeMap<&str, Vec<&Account>> = BTreeMap::new();
    for account in cluster.accounts().filter(|a| !a.is_root()) {
        let parent = account
            .parent
            .as_deref()
            .filter(|p| known.contains(p) && *p != account.name)
            .unwrap_or(ROOT_ACCOUNT);
        children.entry(parent).or_default().push(account);
    }

    let mut visited: BTreeSet<&str> = BTreeSet::from([ROOT_ACCOUNT]);
    let mut queue: VecDeque<&str> = VecDeque::from([ROOT_ACCOUNT]);
    loop {
        while let Some(name) = queue.pop_front() {
            write_group(cluster, name, &children, &mut visited, &mut queue, output)?;
        }
        // Accounts that form a parent cycle are not reachable from root.
        let Some(account) = cluster
            .accounts()
            .find(|a| !visited.contains(a.name.as_str()))
        else {
            break;
        };
        log::warn!(
            "Account `{}` is not reachable from root, writing it under root",
            account.name
        );
        visited.insert(account.name.as_str());
        writeln!(output, "Parent - '{ROOT_ACCOUNT}'")?;
        write_entity(output, "Account", &account.name, &account.specs)?;
        queue.push_back(account.name.as_str());
    }
    Ok(())
}

pub fn dump_to_string(cluster: &Cluster) -> String {
    let mut buffer = Vec::new();
    write_dump(cluster, &mut buffer).expect("writing into a Vec cannot fail");
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::{dump_to_string, parse_dump};
    use crate::SlurmError;
    use crate::model::{Account, Cluster, User};
    use crate::spec::{Spec, SpecSet};

    const DUMP: &str = "Cluster - 'x':F1=1\nParent - 'root'\nUser - 'root':DefaultAccount='root'\nAccount - 'a':F2=2\nParent - 'a'\nUser - 'u':S=1\n";

    fn names<'a>(items: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
        items.collect()
    }

    #[test]
    fn test_parse_basic_dump() {
        let cluster = parse_dump(DUMP).unwrap();
        assert_eq!(cluster.name, "x");
        assert_eq!(cluster.specs.to_strings(), vec!["F1=1"]);
        assert_eq!(
            names(cluster.accounts().map(|a| a.name.as_str())),
            vec!["a", "root"]
        );
        let a = cluster.account("a").unwrap();
        assert_eq!(a.specs.to_strings(), vec!["F2=2"]);
        assert_eq!(a.parent, None);
        assert_eq!(names(a.user_names()), vec!["u"]);
        assert_eq!(a.user("u").unwrap().specs.to_strings(), vec!["S=1"]);
        let root = cluster.account("root").unwrap();
        assert_eq!(names(root.user_names()), vec!["root"]);
    }

    #[test]
    fn test_skip_comments_and_unknown_lines() {
        let input = format!("# Header comment\n\nQOS - 'normal'\n{DUMP}garbage\n");
        let cluster = parse_dump(&input).unwrap();
        assert_eq!(cluster.name, "x");
        assert_eq!(cluster.accounts().count(), 2);
    }

    #[test]
    fn test_user_without_parent() {
        let result = parse_dump("Cluster - 'x'\nUser - 'u':S=1\n");
        assert!(matches!(result, Err(SlurmError::Parse(_))));
    }

    #[test]
    fn test_missing_cluster_name() {
        assert!(matches!(parse_dump(""), Err(SlurmError::Parse(_))));
        assert!(matches!(
            parse_dump("Parent - 'root'\nUser - 'u'\n"),
            Err(SlurmError::Parse(_))
        ));
    }

    #[test]
    fn test_second_cluster_line() {
        let result = parse_dump("Cluster - 'x'\nCluster - 'y'\n");
        assert!(matches!(result, Err(SlurmError::Parse(_))));
    }

    #[test]
    fn test_undeclared_parent() {
        let result = parse_dump("Cluster - 'x'\nParent - 'ghost'\n");
        assert!(matches!(result, Err(SlurmError::Parse(_))));
    }

    #[test]
    fn test_nested_accounts_and_quoted_colons() {
        let input = "Cluster - 'x'\n\
                     Parent - 'root'\n\
                     Account - 'dept':Description='Physics: theory'\n\
                     Parent - 'dept'\n\
                     Account - 'lab'\n\
                     Parent - 'lab'\n\
                     User - 'alice':DefaultAccount='lab':Fairshare=1\n";
        let cluster = parse_dump(input).unwrap();
        let dept = cluster.account("dept").unwrap();
        assert_eq!(dept.specs.get("Description"), Some("'Physics: theory'"));
        let lab = cluster.account("lab").unwrap();
        assert_eq!(lab.parent.as_deref(), Some("dept"));
        assert_eq!(lab.user("alice").unwrap().specs.len(), 2);
    }

    #[test]
    fn test_same_user_twice_accumulates() {
        let input = "Cluster - 'x'\nParent - 'root'\nAccount - 'a'\nParent - 'a'\nUser - 'u':A=1\nUser - 'u':B=2\n";
        let cluster = parse_dump(input).unwrap();
        let user = cluster.account("a").unwrap().user("u").unwrap();
        assert_eq!(user.specs.to_strings(), vec!["A=1", "B=2"]);
    }

    #[test]
    fn test_write_dump() {
        let cluster = parse_dump(DUMP).unwrap();
        insta::assert_snapshot!(dump_to_string(&cluster), @r"
        Cluster - 'x':F1=1
        Parent - 'root'
        User - 'root':DefaultAccount='root'
        Account - 'a':F2=2
        Parent - 'a'
        User - 'u':S=1
        ");
    }

    #[test]
    fn test_write_then_parse_keeps_tree() {
        let mut cluster = Cluster::new("c");
        cluster.specs = SpecSet::parse_joined("Fairshare=1:QOS='normal'", ':').unwrap();
        cluster.get_or_insert_account("root");
        let mut dept = Account::new("dept");
        dept.specs.insert(Spec::new("Description", "'a:b'"));
        cluster.add_account(dept);
        let mut lab = Account::new("lab");
        lab.parent = Some("dept".to_string());
        let specs = SpecSet::parse_joined("Fairshare=parent", ':').unwrap();
        lab.add_user(User::new("alice").with_specs(specs));
        lab.add_user(User::new("bob"));
        cluster.add_account(lab);
        let mut orphan = Account::new("orphan");
        orphan.parent = Some("missing".to_string());
        cluster.add_account(orphan);

        let parsed = parse_dump(&dump_to_string(&cluster)).unwrap();
        assert_eq!(parsed.name, cluster.name);
        assert_eq!(parsed.specs, cluster.specs);
        for account in cluster.accounts() {
            let other = parsed.account(&account.name).unwrap();
            assert_eq!(other.specs, account.specs);
            assert_eq!(names(other.user_names()), names(account.user_names()));
            for user in account.users() {
                assert_eq!(other.user(&user.name).unwrap().specs, user.specs);
            }
        }
        assert_eq!(parsed.account("lab").unwrap().parent.as_deref(), Some("dept"));
        assert_eq!(parsed.account("orphan").unwrap().parent, None);
        assert_eq!(parsed.accounts().count(), cluster.accounts().count());
    }

    #[test]
    fn test_write_parent_cycle() {
        let mut cluster = Cluster::new("c");
        let mut a = Account::new("a");
        a.parent = Some("b".to_string());
        let mut b = Account::new("b");
        b.parent = Some("a".to_string());
        cluster.add_account(a);
        cluster.add_account(b);
        let parsed = parse_dump(&dump_to_string(&cluster)).unwrap();
        assert!(parsed.account("a").is_some());
        assert!(parsed.account("b").is_some());
    }

    #[test]
    fn test_tree_without_root_reads_back_with_root() {
        let mut cluster = Cluster::new("c");
        cluster.add_account(Account::new("lab"));
        assert!(cluster.account("root").is_none());

        let parsed = parse_dump(&dump_to_string(&cluster)).unwrap();
        let names: Vec<&str> = parsed.accounts().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["lab", "root"]);
        assert!(parsed.account("lab").unwrap().parent.is_none());
    }
}
