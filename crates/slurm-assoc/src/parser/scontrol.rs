//! `scontrol --oneliner show partition|node` output.
use crate::Map;
use crate::node::{Node, parse_tres};
use crate::partition::{AccessList, Partition};
use crate::spec::{Spec, SpecSet};

/// Splits one `scontrol --oneliner` record into `Key=Value` items.
///
/// Values may contain `=` (`CfgTRES=cpu=4,mem=8G`) and, for a few keys such as `Reason`, spaces.
/// Tokens without `=` are therefore appended to the previous value.
pub fn parse_oneliner(line: &str) -> Map<&str, String> {
    let mut items: Map<&str, String> = Map::new();
    let mut last_key: Option<&str> = None;
    for token in line.split_whitespace() {
        match token.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                items.insert(key, value.to_string());
                last_key = Some(key);
            }
            _ => {
                if let Some(value) = last_key.and_then(|key| items.get_mut(key)) {
                    value.push(' ');
                    value.push_str(token);
                }
            }
        }
    }
    items
}

fn list(value: Option<&String>) -> Vec<String> {
    match value.map(|v| v.as_str()) {
        None | Some("") | Some("(null)") => Vec::new(),
        Some(value) => value
            .split(',')
            .filter(|item| !item.is_empty())
            .map(|item| item.to_string())
            .collect(),
    }
}

fn access_list(value: Option<&String>) -> AccessList {
    AccessList::parse(value.map(|v| v.as_str()))
}

pub fn parse_partitions(output: &str) -> Vec<Partition> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let items = parse_oneliner(line);
            let Some(name) = items.get("PartitionName") else {
                log::warn!("Skipping scontrol partition record without a name: `{line}`");
                return None;
            };
            let mut specs = SpecSet::new();
            if let Some(weights) = items.get("TRESBillingWeights").filter(|w| !w.is_empty()) {
                specs.insert(Spec::new("TRESBillingWeights", weights.as_str()));
            }
            Some(Partition {
                name: name.clone(),
                specs,
                allowed_accounts: access_list(items.get("AllowAccounts")),
                denied_accounts: list(items.get("DenyAccounts")),
                allowed_groups: list(items.get("AllowGroups")),
                nodes: list(items.get("Nodes")),
            })
        })
        .collect()
}

pub fn parse_nodes(output: &str) -> Vec<Node> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let items = parse_oneliner(line);
            let Some(name) = items.get("NodeName") else {
                log::warn!("Skipping scontrol node record without a name: `{line}`");
                return None;
            };
            let tres = items
                .get("CfgTRES")
                .map(|tres| parse_tres(tres))
                .unwrap_or_default();
            let cpus = items
                .get("CPUTot")
                .and_then(|cpus| cpus.parse::<u32>().ok());
            Some(Node::new(
                name.clone(),
                items
                    .get("State")
                    .map(|state| state.split('+').map(|s| s.to_string()).collect())
                    .unwrap_or_default(),
                list(items.get("Partitions")),
                list(items.get("AvailableFeatures")),
                items
                    .get("Owner")
                    .filter(|owner| !matches!(owner.as_str(), "" | "N/A" | "(null)"))
                    .cloned(),
                tres,
                cpus,
            ))
        })
        .collect()
}
