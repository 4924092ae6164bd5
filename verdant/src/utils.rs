/// Serialisation helpers for config files.
pub mod ordering;
