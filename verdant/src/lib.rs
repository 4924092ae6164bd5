/*!
The verdant greenhouse controller follows the same component pattern used across our
control systems: devices are atomic units, components group devices into something useful,
and each system binary runs exactly one component from a config file. Sensor producers
publish onto a broker, the climate control component fuses their readings and keeps the
ventilation relay within the configured bands.
*/

/// Components in the system are created by grouping together
/// devices into a logical unit that performs some function
/// for the overall control system.
pub mod components;
/// Devices that are an atomic unit, and can be composed
/// with other devices into components to perform some function.
pub mod devices;
/// Error types shared by components and devices.
pub mod error;
/// Message structure for telemetry published by the sensor producers.
pub mod messages;
/// Latest reading per channel and the recorded actuator state.
pub mod state;
/// Development utilities for serialisation and tests.
pub mod utils;
