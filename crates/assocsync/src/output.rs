use cli_table::format::{Justify, Separator};
use cli_table::{Cell, CellStruct, Color, ColorChoice, Style, Table, TableStruct, print_stdout};
use slurm_assoc::client::ShareRow;

use crate::report::{CheckReport, EntityError, SyncReport};

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Outputs {
    CLI,
    JSON,
    Quiet,
}

pub trait Output {
    fn print_sync_reports(&self, reports: &[SyncReport]);
    fn print_check_reports(&self, reports: &[CheckReport]);
    fn print_shares(&self, cluster: &str, rows: &[ShareRow]);
}

pub fn create_output(mode: Outputs, color_policy: ColorChoice) -> Box<dyn Output> {
    match mode {
        Outputs::CLI => Box::new(CliOutput::new(color_policy)),
        Outputs::JSON => Box::new(JsonOutput),
        Outputs::Quiet => Box::new(QuietOutput),
    }
}

pub struct CliOutput {
    color_policy: ColorChoice,
}

impl CliOutput {
    pub fn new(color_policy: ColorChoice) -> CliOutput {
        CliOutput { color_policy }
    }

    fn print_horizontal_table(&self, rows: Vec<Vec<CellStruct>>, header: Vec<CellStruct>) {
        let table = rows
            .table()
            .separator(
                Separator::builder()
                    .title(Some(Default::default()))
                    .column(Some(Default::default()))
                    .build(),
            )
            .title(header);
        self.print_table(table);
    }

    fn print_table(&self, table: TableStruct) {
        let table = table.color_choice(self.color_policy);
        if let Err(e) = print_stdout(table) {
            log::error!("Cannot print table to stdout: {:?}", e);
        }
    }

    fn print_errors(&self, cluster: &str, errors: &[EntityError]) {
        if errors.is_empty() {
            return;
        }
        let rows = errors
            .iter()
            .map(|error| {
                vec![
                    cluster.cell(),
                    error.entity.as_str().cell(),
                    error
                        .message
                        .as_str()
                        .cell()
                        .foreground_color(Some(Color::Red)),
                ]
            })
            .collect();
        let header = vec![
            "Cluster".cell().bold(true),
            "Entity".cell().bold(true),
            "Error".cell().bold(true),
        ];
        self.print_horizontal_table(rows, header);
    }

    fn print_simulated(&self, payloads: &[String]) {
        for payload in payloads {
            println!("[noop] {payload}");
        }
    }
}

fn status_cell(fatal: &Option<String>) -> CellStruct {
    match fatal {
        Some(_) => "FAILED".cell().foreground_color(Some(Color::Red)),
        None => "OK".cell().foreground_color(Some(Color::Green)),
    }
}

fn number(value: usize) -> CellStruct {
    value.cell().justify(Justify::Right)
}

fn metric(value: f64) -> CellStruct {
    format!("{value:.6}").cell().justify(Justify::Right)
}

impl Output for CliOutput {
    fn print_sync_reports(&self, reports: &[SyncReport]) {
        let rows = reports
            .iter()
            .map(|report| {
                vec![
                    report.cluster.as_str().cell(),
                    report.transport.to_string().cell(),
                    status_cell(&report.fatal),
                    number(report.created),
                    number(report.updated),
                    number(report.removed),
                    number(report.errors.len()),
                    report.undetected.join(", ").cell(),
                ]
            })
            .collect();
        let header = vec![
            "Cluster".cell().bold(true),
            "Transport".cell().bold(true),
            "Status".cell().bold(true),
            "Created".cell().bold(true),
            "Updated".cell().bold(true),
            "Removed".cell().bold(true),
            "Errors".cell().bold(true),
            "Undetected projects".cell().bold(true),
        ];
        self.print_horizontal_table(rows, header);

        for report in reports {
            if let Some(error) = &report.fatal {
                println!("{}: {error}", report.cluster);
            }
            self.print_errors(&report.cluster, &report.errors);
            self.print_simulated(&report.simulated);
        }
    }

    fn print_check_reports(&self, reports: &[CheckReport]) {
        let rows = reports
            .iter()
            .map(|report| {
                vec![
                    report.cluster.as_str().cell(),
                    status_cell(&report.fatal),
                    report.removed_accounts.join(", ").cell(),
                    report.removed_associations.join(", ").cell(),
                    number(report.errors.len()),
                ]
            })
            .collect();
        let header = vec![
            "Cluster".cell().bold(true),
            "Status".cell().bold(true),
            "Removed accounts".cell().bold(true),
            "Removed associations".cell().bold(true),
            "Errors".cell().bold(true),
        ];
        self.print_horizontal_table(rows, header);

        for report in reports {
            if let Some(error) = &report.fatal {
                println!("{}: {error}", report.cluster);
            }
            self.print_errors(&report.cluster, &report.errors);
            self.print_simulated(&report.simulated);
        }
    }

    fn print_shares(&self, cluster: &str, rows: &[ShareRow]) {
        let rows = rows
            .iter()
            .map(|row| {
                vec![
                    cluster.cell(),
                    row.account.as_str().cell(),
                    row.user.as_deref().unwrap_or_default().cell(),
                    metric(row.metrics.raw_shares),
                    metric(row.metrics.normalized_shares),
                    metric(row.metrics.raw_usage),
                    metric(row.metrics.effective_usage),
                    metric(row.metrics.fair_share),
                ]
            })
            .collect();
        let header = vec![
            "Cluster".cell().bold(true),
            "Account".cell().bold(true),
            "User".cell().bold(true),
            "Raw shares".cell().bold(true),
            "Norm shares".cell().bold(true),
            "Raw usage".cell().bold(true),
            "Effective usage".cell().bold(true),
            "Fair-share".cell().bold(true),
        ];
        self.print_horizontal_table(rows, header);
    }
}

pub struct JsonOutput;

impl JsonOutput {
    fn save(&self, data: String) {
        println!("{data}");
    }
}

impl Output for JsonOutput {
    fn print_sync_reports(&self, reports: &[SyncReport]) {
        self.save(serde_json::json!(reports).to_string());
    }

    fn print_check_reports(&self, reports: &[CheckReport]) {
        self.save(serde_json::json!(reports).to_string());
    }

    fn print_shares(&self, cluster: &str, rows: &[ShareRow]) {
        let json = serde_json::json!({
            "cluster": cluster,
            "shares": rows,
        });
        self.save(json.to_string());
    }
}

/// Prints nothing, the exit code and the log are the only output.
pub struct QuietOutput;

impl Output for QuietOutput {
    fn print_sync_reports(&self, _reports: &[SyncReport]) {}
    fn print_check_reports(&self, _reports: &[CheckReport]) {}
    fn print_shares(&self, _cluster: &str, _rows: &[ShareRow]) {}
}
