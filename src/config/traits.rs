/// Descriptive metadata shared by every `[channels_config]` section.
pub trait ChannelConfig {
    /// Display name of the channel.
    fn name() -> &'static str;
    /// Short description shown by `courier channel list`.
    fn desc() -> &'static str {
        ""
    }
}
