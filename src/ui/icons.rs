pub struct Icons;

impl Icons {
    pub const ROCKET: &str = "🚀";
    pub const CHECK: &str = "✅";
    pub const WARN: &str = "⚠️";
    pub const INFO: &str = "ℹ️";
    pub const STATS: &str = "📊";
    pub const PACKAGE: &str = "📦";
    pub const FIRE: &str = "🔥";
    pub const PROBE: &str = "📡";
    pub const EXPORT: &str = "🔗";
}
