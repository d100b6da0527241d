use fieldx::fxstruct;

/// Store-wide settings.
///
/// ```
/// # use live_store::config::StoreConfig;
/// let config = StoreConfig::builder().async_flush(true).build().unwrap();
/// assert!(config.async_flush());
/// assert!(!config.log_notifications());
/// ```
#[fxstruct(builder)]
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Defer notification flushes through the store's [`FlushScheduler`](crate::scheduler::FlushScheduler) instead of
    /// flushing as soon as the first notification of a turn is buffered.
    #[fieldx(get(copy), default(false))]
    async_flush: bool,

    /// Trace every notification as it is buffered and delivered.
    #[fieldx(get(copy), default(false))]
    log_notifications: bool,
}
