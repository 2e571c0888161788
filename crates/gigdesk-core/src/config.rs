use crate::error::{GigError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// StallThresholds
// ---------------------------------------------------------------------------

/// Hours an entity may sit before it counts as stalled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StallThresholds {
    #[serde(default = "default_lead_no_response")]
    pub lead_no_response_hours: f64,
    #[serde(default = "default_job_overdue")]
    pub job_overdue_hours: f64,
    #[serde(default = "default_invoice_draft")]
    pub invoice_draft_hours: f64,
    #[serde(default = "default_invoice_idle")]
    pub invoice_idle_hours: f64,
}

fn default_lead_no_response() -> f64 {
    24.0
}

fn default_job_overdue() -> f64 {
    2.0
}

fn default_invoice_draft() -> f64 {
    24.0
}

fn default_invoice_idle() -> f64 {
    72.0
}

impl Default for StallThresholds {
    fn default() -> Self {
        Self {
            lead_no_response_hours: default_lead_no_response(),
            job_overdue_hours: default_job_overdue(),
            invoice_draft_hours: default_invoice_draft(),
            invoice_idle_hours: default_invoice_idle(),
        }
    }
}

// ---------------------------------------------------------------------------
// DeliveryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryConfig {
    /// Log the send instead of contacting anyone.
    #[default]
    Log,
    /// POST each send to an SMS/email gateway.
    Webhook {
        url: String,
        #[serde(default = "default_webhook_timeout")]
        timeout_secs: u64,
    },
}

fn default_webhook_timeout() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Upper bound for the hour-valued settings (ten years).
pub const MAX_HOURS: i64 = 24 * 365 * 10;

/// Upper bound for the sweep interval (one week).
pub const MAX_SCAN_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

/// Out-of-range values are clamped; `validate` reports them as errors.
fn clamped_hours(hours: i64) -> chrono::Duration {
    chrono::Duration::hours(hours.clamp(-MAX_HOURS, MAX_HOURS))
}

/// Sweep period for `minutes`, clamped to `MAX_SCAN_INTERVAL_MINUTES`.
pub fn scan_interval_from_minutes(minutes: u64) -> Duration {
    Duration::from_secs(minutes.min(MAX_SCAN_INTERVAL_MINUTES) * 60)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_scan_interval")]
    pub scan_interval_minutes: u64,
    #[serde(default = "default_action_ttl")]
    pub action_ttl_hours: i64,
    #[serde(default = "default_inactivity_gate")]
    pub inactivity_gate_hours: i64,
    #[serde(default = "default_cooldown")]
    pub cooldown_hours: i64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    #[serde(default)]
    pub thresholds: StallThresholds,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

fn default_scan_interval() -> u64 {
    15
}

fn default_action_ttl() -> i64 {
    24
}

fn default_inactivity_gate() -> i64 {
    6
}

fn default_cooldown() -> i64 {
    48
}

fn default_call_timeout() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_interval_minutes: default_scan_interval(),
            action_ttl_hours: default_action_ttl(),
            inactivity_gate_hours: default_inactivity_gate(),
            cooldown_hours: default_cooldown(),
            call_timeout_secs: default_call_timeout(),
            thresholds: StallThresholds::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: EngineConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    /// Load and reject configs that carry error-level warnings.
    pub fn load_validated(path: &Path) -> Result<Self> {
        let cfg = Self::load(path)?;
        let errors: Vec<String> = cfg
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if !errors.is_empty() {
            return Err(GigError::InvalidConfig(errors.join("; ")));
        }
        Ok(cfg)
    }

    pub fn scan_interval(&self) -> Duration {
        scan_interval_from_minutes(self.scan_interval_minutes)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn action_ttl(&self) -> chrono::Duration {
        clamped_hours(self.action_ttl_hours)
    }

    pub fn inactivity_gate(&self) -> chrono::Duration {
        clamped_hours(self.inactivity_gate_hours)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        clamped_hours(self.cooldown_hours)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let error = |message: String| ConfigWarning {
            level: WarnLevel::Error,
            message,
        };
        let warning = |message: String| ConfigWarning {
            level: WarnLevel::Warning,
            message,
        };

        if self.scan_interval_minutes == 0 {
            warnings.push(error("scan_interval_minutes must be at least 1".into()));
        }
        if self.scan_interval_minutes > MAX_SCAN_INTERVAL_MINUTES {
            warnings.push(error(format!(
                "scan_interval_minutes must be at most {MAX_SCAN_INTERVAL_MINUTES}"
            )));
        }
        for (name, value) in [
            ("action_ttl_hours", self.action_ttl_hours),
            ("inactivity_gate_hours", self.inactivity_gate_hours),
            ("cooldown_hours", self.cooldown_hours),
        ] {
            if value > MAX_HOURS {
                warnings.push(error(format!("{name} must be at most {MAX_HOURS}")));
            }
        }
        if self.call_timeout_secs == 0 {
            warnings.push(error("call_timeout_secs must be at least 1".into()));
        }
        if self.action_ttl_hours <= 0 {
            warnings.push(error("action_ttl_hours must be positive".into()));
        }
        if self.inactivity_gate_hours < 0 || self.cooldown_hours < 0 {
            warnings.push(error(
                "inactivity_gate_hours and cooldown_hours cannot be negative".into(),
            ));
        }

        let t = &self.thresholds;
        for (name, value) in [
            ("lead_no_response_hours", t.lead_no_response_hours),
            ("job_overdue_hours", t.job_overdue_hours),
            ("invoice_draft_hours", t.invoice_draft_hours),
            ("invoice_idle_hours", t.invoice_idle_hours),
        ] {
            if !value.is_finite() || value < 0.0 {
                warnings.push(error(format!(
                    "thresholds.{name} must be a non-negative number"
                )));
            }
        }

        if self.action_ttl_hours > 0
            && (self.action_ttl_hours as u64).saturating_mul(60) < self.scan_interval_minutes
        {
            warnings.push(warning(format!(
                "action_ttl_hours ({}h) is shorter than the scan interval ({}m); \
                 actions will expire before the next scan",
                self.action_ttl_hours, self.scan_interval_minutes
            )));
        }

        if self.cooldown_hours > 0 && self.cooldown_hours < self.action_ttl_hours {
            warnings.push(warning(format!(
                "cooldown_hours ({}h) is shorter than action_ttl_hours ({}h); \
                 one stall may be messaged more than once",
                self.cooldown_hours, self.action_ttl_hours
            )));
        }

        if let DeliveryConfig::Webhook { url, timeout_secs } = &self.delivery {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                warnings.push(error(format!(
                    "delivery.url '{url}' must start with http:// or https://"
                )));
            }
            if *timeout_secs >= self.call_timeout_secs {
                warnings.push(warning(format!(
                    "delivery.timeout_secs ({timeout_secs}s) is not below call_timeout_secs ({}s)",
                    self.call_timeout_secs
                )));
            }
        }

        warnings
    }
}
