/// Standardise how telemetry enters the control system. Each
/// producer publishes its own wire format, these modules decode
/// them into typed messages and provide a test suite to ensure
/// the interfaces are respected.
pub mod telemetry {
    /// JSON bundle of temperature and light from the Pi host.
    pub mod pi;
    /// Delimited CO2, humidity and soil moisture record from the
    /// microcontroller.
    pub mod esp;
    /// JSON envelope of vision metadata and a base64 encoded frame.
    pub mod camera;
}
