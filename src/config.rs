use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use uuid::Uuid;

use crate::transport::CharacteristicId;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

/// Which controller to look for and how to talk to it.
#[derive(Clone, Debug, Deserialize)]
pub struct DeviceConfig {
    /// Matched case-insensitively against a substring of the advertised name.
    #[serde(default = "DeviceConfig::default_name_filter")]
    pub name_filter: String,
    /// Only scan for devices advertising this service.
    #[serde(default)]
    pub service: Option<Uuid>,
    #[serde(default = "DeviceConfig::default_notify_characteristics")]
    pub notify_characteristics: Vec<CharacteristicId>,
    #[serde(default = "DeviceConfig::default_write_characteristic")]
    pub write_characteristic: CharacteristicId,
    #[serde(default = "DeviceConfig::default_write_with_response")]
    pub write_with_response: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "TimingConfig::default_discovery_secs")]
    pub discovery_secs: u64,
    #[serde(default = "TimingConfig::default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "TimingConfig::default_subscribe_secs")]
    pub subscribe_secs: u64,
    #[serde(default = "TimingConfig::default_response_secs")]
    pub response_secs: u64,
    #[serde(default = "TimingConfig::default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "TimingConfig::default_backoff_secs")]
    pub backoff_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RecoveryConfig {
    /// Consecutive failed cycles before the radio stack is reset.
    #[serde(default = "RecoveryConfig::default_threshold")]
    pub threshold: u32,
    #[serde(default = "RecoveryConfig::default_steps")]
    pub steps: Vec<ResetStep>,
}

/// One OS command of the radio reset sequence.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ResetStep {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "ReportConfig::default_interval_secs")]
    pub interval_secs: u64,
}

impl Config {
    /// Load the config at `path`. A missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let txt = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&txt).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn parse(txt: &str) -> Result<Self> {
        let mut cfg: Config = toml::from_str(txt)?;
        cfg.fill_zeroes();
        Ok(cfg)
    }

    fn fill_zeroes(&mut self) {
        let t = &mut self.timing;
        for (value, default) in [
            (&mut t.discovery_secs, TimingConfig::default_discovery_secs()),
            (&mut t.connect_secs, TimingConfig::default_connect_secs()),
            (&mut t.subscribe_secs, TimingConfig::default_subscribe_secs()),
            (&mut t.response_secs, TimingConfig::default_response_secs()),
            (&mut t.poll_interval_secs, TimingConfig::default_poll_interval_secs()),
            (&mut t.backoff_secs, TimingConfig::default_backoff_secs()),
            (&mut self.report.interval_secs, ReportConfig::default_interval_secs()),
        ] {
            if *value == 0 {
                *value = default;
            }
        }
        if self.recovery.threshold == 0 {
            self.recovery.threshold = RecoveryConfig::default_threshold();
        }
        if self.device.name_filter.trim().is_empty() {
            self.device.name_filter = DeviceConfig::default_name_filter();
        }
    }
}

impl DeviceConfig {
    fn default_name_filter() -> String {
        "Solar".to_string()
    }
    fn default_notify_characteristics() -> Vec<CharacteristicId> {
        vec![CharacteristicId::Uuid(Uuid::from_u128(0xf000ffc2_0451_4000_b000_000000000000))]
    }
    fn default_write_characteristic() -> CharacteristicId {
        CharacteristicId::Uuid(Uuid::from_u128(0x00002af1_0000_1000_8000_00805f9b34fb))
    }
    fn default_write_with_response() -> bool {
        true
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name_filter: Self::default_name_filter(),
            service: None,
            notify_characteristics: Self::default_notify_characteristics(),
            write_characteristic: Self::default_write_characteristic(),
            write_with_response: Self::default_write_with_response(),
        }
    }
}

impl TimingConfig {
    fn default_discovery_secs() -> u64 {
        15
    }
    fn default_connect_secs() -> u64 {
        30
    }
    fn default_subscribe_secs() -> u64 {
        15
    }
    fn default_response_secs() -> u64 {
        20
    }
    fn default_poll_interval_secs() -> u64 {
        55
    }
    fn default_backoff_secs() -> u64 {
        10
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_secs)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_secs)
    }
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_secs)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            discovery_secs: Self::default_discovery_secs(),
            connect_secs: Self::default_connect_secs(),
            subscribe_secs: Self::default_subscribe_secs(),
            response_secs: Self::default_response_secs(),
            poll_interval_secs: Self::default_poll_interval_secs(),
            backoff_secs: Self::default_backoff_secs(),
        }
    }
}

impl RecoveryConfig {
    fn default_threshold() -> u32 {
        10
    }
    fn default_steps() -> Vec<ResetStep> {
        [
            ("hciconfig", &["hci0", "down"][..]),
            ("rmmod", &["btusb"][..]),
            ("modprobe", &["btusb"][..]),
            ("systemctl", &["restart", "bluetooth"][..]),
            ("hciconfig", &["hci0", "up"][..]),
        ]
        .into_iter()
        .map(|(program, args)| ResetStep {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        })
        .collect()
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { threshold: Self::default_threshold(), steps: Self::default_steps() }
    }
}

impl ReportConfig {
    fn default_interval_secs() -> u64 {
        30
    }
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self { interval_secs: Self::default_interval_secs() }
    }
}

#[test]
fn test_empty_config_is_defaults() {
    let cfg = Config::parse("").unwrap();
    assert_eq!(cfg.device.name_filter, "Solar");
    assert_eq!(cfg.device.notify_characteristics.len(), 1);
    assert_eq!(cfg.device.write_characteristic.to_string(), "00002af1-0000-1000-8000-00805f9b34fb");
    assert!(cfg.device.write_with_response);
    assert_eq!(cfg.timing.poll_interval(), Duration::from_secs(55));
    assert_eq!(cfg.recovery.threshold, 10);
    assert_eq!(cfg.recovery.steps.len(), 5);
    assert_eq!(cfg.report.interval(), Duration::from_secs(30));
}

#[test]
fn test_config_overrides_and_handles() {
    let cfg = Config::parse(
        r#"
        [device]
        name_filter = "Solar regulator"
        notify_characteristics = [0x0e, 0x25, 0x29, "f000ffc2-0451-4000-b000-000000000000"]
        write_with_response = false

        [timing]
        response_secs = 5
        backoff_secs = 0

        [recovery]
        threshold = 3
        steps = [{ program = "bluetoothctl", args = ["power", "off"] }]
        "#,
    )
    .unwrap();
    assert_eq!(cfg.device.name_filter, "Solar regulator");
    assert_eq!(cfg.device.notify_characteristics[0], CharacteristicId::Handle(0x0e));
    assert_eq!(cfg.device.notify_characteristics[2], CharacteristicId::Handle(0x29));
    assert!(matches!(cfg.device.notify_characteristics[3], CharacteristicId::Uuid(_)));
    assert!(!cfg.device.write_with_response);
    assert_eq!(cfg.timing.response_timeout(), Duration::from_secs(5));
    assert_eq!(cfg.timing.backoff(), Duration::from_secs(10));
    assert_eq!(cfg.recovery.threshold, 3);
    assert_eq!(
        cfg.recovery.steps,
        vec![ResetStep { program: "bluetoothctl".to_string(), args: vec!["power".to_string(), "off".to_string()] }]
    );
}

#[test]
fn test_missing_file_is_defaults() {
    let cfg = Config::load(Path::new("/nonexistent/mpptread.toml")).unwrap();
    assert_eq!(cfg.timing.connect_timeout(), Duration::from_secs(30));
}

#[test]
fn test_invalid_config_is_an_error() {
    assert!(Config::parse("[timing]\nresponse_secs = \"soon\"").is_err());
}
