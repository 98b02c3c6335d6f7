// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hw_server::LockKind;
use serde::Deserialize;
use userlib::Priority;

/// A scenario file: who runs at what priority, and how often.
///
/// Every table and key is optional; what's missing takes the values the
/// standalone programs default to.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// How long a run lasts, in milliseconds.
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    /// Pin every thread to this CPU.
    pub cpu: Option<usize>,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub high_prio_client: HighSection,
    #[serde(default)]
    pub low_prio_client: LowSection,
    #[serde(default)]
    pub cpu_burner: BurnerSection,
    #[serde(default)]
    pub probe: ProbeSection,
}

fn default_duration_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            duration_ms: default_duration_ms(),
            cpu: None,
            server: ServerSection::default(),
            high_prio_client: HighSection::default(),
            low_prio_client: LowSection::default(),
            cpu_burner: BurnerSection::default(),
            probe: ProbeSection::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ServerSection {
    pub workers: usize,
    pub priority: u8,
    pub lock: LockKind,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            workers: 4,
            priority: 10,
            lock: LockKind::Semaphore,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct HighSection {
    pub priority: u8,
    pub deadline_ms: f64,
    pub trigger: bool,
    pub interval_ms: u64,
    pub start_delay_ms: u64,
}

impl Default for HighSection {
    fn default() -> Self {
        Self {
            priority: 40,
            deadline_ms: 1.0,
            trigger: false,
            interval_ms: 7,
            start_delay_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct LowSection {
    pub priority: u8,
    pub interval_ms: u64,
    pub start_delay_ms: u64,
}

impl Default for LowSection {
    fn default() -> Self {
        Self {
            priority: 11,
            interval_ms: 11,
            start_delay_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct BurnerSection {
    /// Leave the burner out entirely.
    pub disabled: bool,
    pub priority: u8,
    pub burn_us: u32,
    pub interval_ms: u64,
    pub start_delay_ms: u64,
}

impl Default for BurnerSection {
    fn default() -> Self {
        Self {
            disabled: false,
            priority: 15,
            burn_us: cpu_burner::DEFAULT_BURN_US,
            interval_ms: 13,
            start_delay_ms: 2000,
        }
    }
}

/// Settings for the single forced-contention probe.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProbeSection {
    /// Uncontended operations timed before the hardware is tied up.
    pub warmup_ticks: u32,
    /// Length of the low-priority request that ties it up.
    pub hold_us: u32,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            warmup_ticks: 10,
            hold_us: 20_000,
        }
    }
}

fn priority(who: &str, p: u8) -> Result<Priority> {
    let p = Priority(p);
    if !p.is_valid() {
        bail!(
            "{who} priority {p} is outside {}..={}",
            Priority::MIN,
            Priority::MAX
        );
    }
    Ok(p)
}

fn interval(who: &str, ms: u64) -> Result<Duration> {
    if ms == 0 {
        bail!("{who} interval must be nonzero");
    }
    Ok(Duration::from_millis(ms))
}

impl Config {
    pub fn from_file(cfg: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(cfg)
            .with_context(|| format!("reading {}", cfg.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("parsing {}", cfg.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks everything that can be checked before starting threads.
    pub fn validate(&self) -> Result<()> {
        if self.server.workers == 0 {
            bail!("server needs at least one worker");
        }
        self.server_priority()?;
        self.high_priority()?;
        self.low_priority()?;
        self.burner_priority()?;
        self.deadline_ns()?;
        interval("high-prio-client", self.high_prio_client.interval_ms)?;
        interval("low-prio-client", self.low_prio_client.interval_ms)?;
        if !self.cpu_burner.disabled {
            interval("cpu-burner", self.cpu_burner.interval_ms)?;
        }
        Ok(())
    }

    pub fn server_priority(&self) -> Result<Priority> {
        priority("server", self.server.priority)
    }

    pub fn high_priority(&self) -> Result<Priority> {
        priority("high-prio-client", self.high_prio_client.priority)
    }

    pub fn low_priority(&self) -> Result<Priority> {
        priority("low-prio-client", self.low_prio_client.priority)
    }

    pub fn burner_priority(&self) -> Result<Priority> {
        priority("cpu-burner", self.cpu_burner.priority)
    }

    pub fn deadline_ns(&self) -> Result<u64> {
        let ms = self.high_prio_client.deadline_ms;
        high_prio_client::parse_deadline_ms(&ms.to_string())
            .map_err(anyhow::Error::msg)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_the_stock_scenario() {
        let c: Config = toml::from_str("").unwrap();
        c.validate().unwrap();
        assert_eq!(c.duration_ms, 5000);
        assert_eq!(c.server.workers, 4);
        assert_eq!(c.server.lock, LockKind::Semaphore);
        assert_eq!(c.high_priority().unwrap(), Priority(40));
        assert_eq!(c.deadline_ns().unwrap(), 1_000_000);
        assert_eq!(c.low_prio_client.interval_ms, 11);
        assert_eq!(c.cpu_burner.burn_us, 2100);
    }

    #[test]
    fn default_matches_an_empty_file() {
        let file: Config = toml::from_str("").unwrap();
        let built = Config::default();
        assert_eq!(built.duration_ms, file.duration_ms);
        assert_eq!(built.duration(), Duration::from_millis(5000));
        assert_eq!(built.cpu, file.cpu);
        assert_eq!(built.server.workers, file.server.workers);
        assert_eq!(built.server.lock, file.server.lock);
        assert_eq!(
            built.deadline_ns().unwrap(),
            file.deadline_ns().unwrap()
        );
        assert_eq!(
            built.cpu_burner.start_delay_ms,
            file.cpu_burner.start_delay_ms
        );
        assert_eq!(built.probe.hold_us, file.probe.hold_us);
        built.validate().unwrap();
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let c: Config = toml::from_str(
            r#"
            duration-ms = 250

            [server]
            lock = "inheriting-mutex"

            [high-prio-client]
            deadline-ms = 0.7
            "#,
        )
        .unwrap();
        c.validate().unwrap();
        assert_eq!(c.duration(), Duration::from_millis(250));
        assert_eq!(c.server.lock, LockKind::InheritingMutex);
        assert_eq!(c.server.priority, 10);
        assert_eq!(c.deadline_ns().unwrap(), 700_000);
        assert_eq!(c.high_prio_client.interval_ms, 7);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("[server]\nthreads = 2\n").is_err());
        assert!(toml::from_str::<Config>("colour = \"blue\"\n").is_err());
    }

    #[test]
    fn nonsense_values_fail_validation() {
        let bad = [
            "[server]\nworkers = 0\n",
            "[server]\npriority = 0\n",
            "[high-prio-client]\npriority = 100\n",
            "[high-prio-client]\ndeadline-ms = 0.0\n",
            "[low-prio-client]\ninterval-ms = 0\n",
        ];
        for text in bad {
            let c: Config = toml::from_str(text).unwrap();
            assert!(c.validate().is_err(), "{text}");
        }
    }

    #[test]
    fn reads_the_shipped_scenario() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("app.toml");
        let c = Config::from_file(&path).unwrap();
        assert_eq!(c.deadline_ns().unwrap(), 700_000);
    }
}
