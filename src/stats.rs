//! Transfer statistics: plain counters accumulated by the reactor loop and
//! dumped as JSON at the end of a run.
//!
//! Grounded on the original collaborator's `struct stats` and `dump_stats`:
//! same four scalar counters plus one counter per consumer, keyed by the
//! consumer's display name rather than its numeric index.

use crate::endpoint::MAX_CONSUMERS;
use crate::Result;
use anyhow::Context;
use serde::Serialize;
use std::fs::File;
use std::io::Write;

#[derive(Debug, Default, Clone, Copy)]
pub struct TransferStats {
    pub total_cycles: u64,
    pub waited_cycles: u64,
    pub buffer_underruns: u64,
    pub buffer_overruns: u64,
    pub consumer_slowdowns: [u64; MAX_CONSUMERS],
}

#[derive(Serialize)]
struct StatsDoc {
    total_cycles: u64,
    waited_cycles: u64,
    buffer_underruns: u64,
    buffer_overruns: u64,
    consumer_slowdowns: std::collections::BTreeMap<String, u64>,
}

impl TransferStats {
    /// Serializes to JSON and writes it to `path`, keying `consumer_slowdowns`
    /// by each consumer's display name.
    pub fn dump(&self, path: &str, consumer_names: &[&str]) -> Result<()> {
        let mut slowdowns = std::collections::BTreeMap::new();
        for (i, name) in consumer_names.iter().enumerate() {
            slowdowns.insert(name.to_string(), self.consumer_slowdowns[i]);
        }

        let doc = StatsDoc {
            total_cycles: self.total_cycles,
            waited_cycles: self.waited_cycles,
            buffer_underruns: self.buffer_underruns,
            buffer_overruns: self.buffer_overruns,
            consumer_slowdowns: slowdowns,
        };

        let json = serde_json::to_string(&doc).context("failed to serialize stats")?;
        let mut file = File::create(path).with_context(|| format!("fopen() failed for {}", path))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write stats to {}", path))?;
        file.write_all(b"\n").with_context(|| format!("failed to write stats to {}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dumps_counters_and_named_slowdowns() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("stats.json");

        let mut stats = TransferStats::default();
        stats.total_cycles = 10;
        stats.waited_cycles = 3;
        stats.buffer_overruns = 1;
        stats.buffer_underruns = 2;
        stats.consumer_slowdowns[0] = 5;
        stats.consumer_slowdowns[1] = 0;

        stats.dump(path.to_str().unwrap(), &["out-a.dat", "out-b.dat"]).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1, "stats must be a single line of JSON");

        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["total_cycles"], 10);
        assert_eq!(parsed["waited_cycles"], 3);
        assert_eq!(parsed["buffer_overruns"], 1);
        assert_eq!(parsed["buffer_underruns"], 2);
        assert_eq!(parsed["consumer_slowdowns"]["out-a.dat"], 5);
        assert_eq!(parsed["consumer_slowdowns"]["out-b.dat"], 0);
    }
}
