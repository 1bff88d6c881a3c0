// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::env;

/// Position of this process in a distributed job. Used to label report lines only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankInfo {
    pub rank: u32,
    pub size: u32,
}

impl RankInfo {
    pub const SINGLE: RankInfo = RankInfo { rank: 0, size: 1 };

    pub fn new(rank: u32, size: u32) -> Self {
        let size = size.max(1);
        Self {
            rank: rank.min(size - 1),
            size,
        }
    }

    /// Width of the zero-padded rank label: enough digits for `size`, and never fewer than 3.
    pub fn label_width(&self) -> usize {
        decimal_digits(self.size as u64).max(3)
    }
}

impl Default for RankInfo {
    fn default() -> Self {
        Self::SINGLE
    }
}

pub(crate) fn decimal_digits(mut n: u64) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Source of the (rank, size) pair used to label reports.
pub trait RankProvider: Send + Sync {
    fn current(&self) -> RankInfo;
}

/// Reads the variables set by the common process launchers. Falls back to rank 0 of 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvRankProvider;

const LAUNCHER_VARIABLES: &[(&str, Option<&str>)] = &[
    ("OMPI_COMM_WORLD_RANK", Some("OMPI_COMM_WORLD_SIZE")),
    ("PMI_RANK", Some("PMI_SIZE")),
    ("PMIX_RANK", None),
    ("MV2_COMM_WORLD_RANK", Some("MV2_COMM_WORLD_SIZE")),
    ("SLURM_PROCID", Some("SLURM_NTASKS")),
];

impl EnvRankProvider {
    fn lookup(var: impl Fn(&str) -> Option<String>) -> RankInfo {
        let parse = |name: &str| var(name).and_then(|v| v.trim().parse::<u32>().ok());
        for (rank_var, size_var) in LAUNCHER_VARIABLES {
            if let Some(rank) = parse(*rank_var) {
                let size = size_var
                    .and_then(|name| parse(name))
                    .unwrap_or(rank.saturating_add(1));
                return RankInfo::new(rank, size);
            }
        }
        RankInfo::SINGLE
    }
}

impl RankProvider for EnvRankProvider {
    fn current(&self) -> RankInfo {
        Self::lookup(|name| env::var(name).ok())
    }
}

/// A fixed rank, for hosts that already know their position in the job.
#[derive(Debug, Clone, Copy)]
pub struct StaticRankProvider(pub RankInfo);

impl RankProvider for StaticRankProvider {
    fn current(&self) -> RankInfo {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> RankInfo {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvRankProvider::lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_no_launcher_is_rank_zero_of_one() {
        assert_eq!(lookup(&[]), RankInfo::SINGLE);
    }

    #[test]
    fn test_open_mpi_variables() {
        let info = lookup(&[
            ("OMPI_COMM_WORLD_RANK", "7"),
            ("OMPI_COMM_WORLD_SIZE", "16"),
        ]);
        assert_eq!(info, RankInfo::new(7, 16));
    }

    #[test]
    fn test_slurm_variables_and_garbage() {
        let info = lookup(&[
            ("PMI_RANK", "not-a-number"),
            ("SLURM_PROCID", "3"),
            ("SLURM_NTASKS", "4"),
        ]);
        assert_eq!(info, RankInfo::new(3, 4));
    }

    #[test]
    fn test_label_width() {
        assert_eq!(RankInfo::new(0, 1).label_width(), 3);
        assert_eq!(RankInfo::new(0, 999).label_width(), 3);
        assert_eq!(RankInfo::new(0, 1000).label_width(), 4);
        assert_eq!(RankInfo::new(0, 123_456).label_width(), 6);
    }
}
