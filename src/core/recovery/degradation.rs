//! Graded feature degradation.
//!
//! Level 0 is full functionality and 5 the most degraded. Each remote
//! feature has a threshold: it is unavailable once the level reaches it.

pub const MAX_LEVEL: u8 = 5;

/// Level applied while offline mode is active.
pub const OFFLINE_LEVEL: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureGate {
    /// Available while the level is below the threshold.
    Below(u8),
    /// Runs locally; never disabled.
    Always,
}

const FEATURES: &[(&str, FeatureGate)] = &[
    ("tool_integration", FeatureGate::Below(1)),
    ("streaming", FeatureGate::Below(2)),
    ("conversation_sync", FeatureGate::Below(2)),
    ("error_stats", FeatureGate::Below(2)),
    ("message_history", FeatureGate::Below(3)),
    ("send_message", FeatureGate::Below(4)),
    ("health_check", FeatureGate::Always),
    ("local_drafts", FeatureGate::Always),
    ("error_reporting", FeatureGate::Always),
];

pub fn gate_for(feature: &str) -> Option<FeatureGate> {
    FEATURES
        .iter()
        .find(|(name, _)| *name == feature)
        .map(|(_, gate)| *gate)
}

/// Unknown features are only available at full functionality.
pub fn is_available(feature: &str, level: u8) -> bool {
    match gate_for(feature) {
        Some(FeatureGate::Always) => true,
        Some(FeatureGate::Below(threshold)) => level < threshold,
        None => level == 0,
    }
}

pub fn clamp_level(level: i32) -> u8 {
    level.clamp(0, i32::from(MAX_LEVEL)) as u8
}

/// Names of the known features, for diagnostics.
pub fn known_features() -> impl Iterator<Item = &'static str> {
    FEATURES.iter().map(|(name, _)| *name)
}
