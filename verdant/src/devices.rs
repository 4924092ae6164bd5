/// Devices are the atomic units that can be combined together
/// into components. Their core responsibilities do not change
/// based on location, name etc.
pub mod hardware {
    /// Digital output lines such as relays and buzzers.
    pub mod output_line;
}
