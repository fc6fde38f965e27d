//! Wireless protocol stack error codes and events.

/// Errors surfaced by the stack, either as API return values or through the
/// event callback of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WpsError {
    /// An API call was made before `init`.
    NotInit,
    /// A frame was received while the RX queue was full; it was discarded.
    RxOverrun,
    /// The PHY state machine received a signal it cannot handle. Fatal, the
    /// host must reset the stack.
    PhyCritical,
    /// There is no frame to dequeue from the connection.
    QueueEmpty,
    /// The connection queue is full, the frame was not enqueued.
    QueueFull,
    /// The TX payload is larger than the configured frame size.
    WrongTxSize,
    /// The RX buffer is smaller than the received payload.
    WrongRxSize,
    /// The connection throttle pattern was used before initialization.
    ConnThrottleNotInit,
    /// The stack is already connected.
    AlreadyConnected,
    /// The stack is already disconnected.
    AlreadyDisconnected,
    /// The channel sequence was not configured.
    ChannelSequenceNotInit,
    /// Acknowledges must be enabled before the stop-and-wait ARQ.
    AckDisabled,
    /// The register write request queue is full.
    WriteRequestQueueFull,
    /// The register read request queue is full.
    ReadRequestQueueFull,
    /// The application request queue is full.
    RequestQueueFull,
    /// The schedule ratio request queue is full.
    ScheduleRatioRequestQueueFull,
    /// A fragment arrived out of order or with an invalid transfer type.
    FragmentError,
    /// The disconnect sequence exceeded its budget.
    DisconnectTimeout,
    /// The timeslot connection table is full.
    TimeslotConnLimitReached,
    /// A configured table or buffer is too small for the requested setup.
    NotEnoughMemory,
    /// The CCA settings are invalid.
    InvalidCcaSettings,
    /// The network channel sequence could not be initialized.
    ChannelSequenceInitError,
}

/// Asynchronous events reported through the connection event callback.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WpsEvent {
    /// No event pending.
    #[default]
    None,
    /// An error occurred, read it with [`Wps::get_error`](crate::Wps::get_error).
    Error,
    /// The connection transitioned to connected.
    Connect,
    /// The connection transitioned to disconnected.
    Disconnect,
}
