use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    pub tick_ms: u64,
    pub polarity_period_ms: u64,
    pub default_duration_hours: u8,
    pub log_capacity: usize,
    pub upgrade_poll_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            polarity_period_ms: 1_200_000,
            default_duration_hours: 3,
            log_capacity: 100,
            upgrade_poll_ms: 1_000,
        }
    }
}

impl ControlConfig {
    pub fn sanitize(&mut self) {
        self.tick_ms = self.tick_ms.clamp(10, 1_000);
        self.polarity_period_ms = self.polarity_period_ms.clamp(60_000, 14_400_000);
        self.default_duration_hours = self.default_duration_hours.clamp(1, 8);
        self.log_capacity = self.log_capacity.clamp(10, 1_000);
        self.upgrade_poll_ms = self.upgrade_poll_ms.clamp(100, 10_000);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    #[serde(default)]
    pub ota_url: String,
    #[serde(default)]
    pub ota_sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub control: ControlConfig,
    pub timezone: String,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            control: ControlConfig::default(),
            timezone: "Europe/Vienna".to_string(),
            network: NetworkConfig::default(),
        }
    }
}
