/// Components that are placed within a greenhouse.
pub mod greenhouse {
    /// Components that provide sensing capability.
    pub mod sensing {
        /// Topic classification and payload decoding.
        pub mod telemetry_router;
    }
    /// Components that provide actuation capability.
    pub mod actuating {
        /// Hysteresis control of the ventilation relay and alert.
        pub mod relay;
    }
    /// Components that persist data off the control path.
    pub mod archiving {
        /// SQLite archive of camera frames.
        pub mod frame_archive;
    }
    /// The climate control service tying the greenhouse components together.
    pub mod climate_control;
}

/// Helpful prelude when working with components.
pub mod prelude {
    pub use crate::components::greenhouse::actuating::relay::*;
    pub use crate::components::greenhouse::archiving::frame_archive::*;
    pub use crate::components::greenhouse::climate_control::*;
    pub use crate::components::greenhouse::sensing::telemetry_router::*;
}
