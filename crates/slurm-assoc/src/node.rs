use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Parses a TRES string (`cpu=64,mem=512G,gres/gpu=4`) into a map.
/// Items without a value are ignored.
pub fn parse_tres(tres: &str) -> BTreeMap<String, String> {
    tres.split(',')
        .filter_map(|item| item.trim().split_once('='))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Number of GPUs in a parsed TRES map. `gres/gpu` is the total, typed entries
/// (`gres/gpu:a100`) are only summed if the total is missing.
pub fn gpu_count(tres: &BTreeMap<String, String>) -> u32 {
    if let Some(total) = tres.get("gres/gpu") {
        return total.parse().unwrap_or(0);
    }
    tres.iter()
        .filter(|(key, _)| key.starts_with("gres/gpu:"))
        .filter_map(|(_, value)| value.parse::<u32>().ok())
        .sum()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub state: Vec<String>,
    pub partitions: Vec<String>,
    pub features: Vec<String>,
    pub cpus: u32,
    pub gpus: u32,
    /// Account or user that owns the node, if the scheduler reports one.
    pub owner: Option<String>,
    pub tres: BTreeMap<String, String>,
}

impl Node {
    pub fn new(
        name: String,
        state: Vec<String>,
        partitions: Vec<String>,
        features: Vec<String>,
        owner: Option<String>,
        tres: BTreeMap<String, String>,
        cpus: Option<u32>,
    ) -> Self {
        let cpus = cpus
            .or_else(|| tres.get("cpu").and_then(|cpu| cpu.parse().ok()))
            .unwrap_or(0);
        Self {
            name,
            state,
            partitions,
            features,
            cpus,
            gpus: gpu_count(&tres),
            owner,
            tres,
        }
    }
}
