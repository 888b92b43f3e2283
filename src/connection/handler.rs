use bytes::Bytes;

/// The seam between a connection and whatever sits on top of it. Implementations are passed
///  around as `Arc<dyn ConnectionHandler>` to keep the connection free of upper-layer types.
#[async_trait::async_trait]
pub trait ConnectionHandler: 'static + Sync + Send {
    /// called once per fully reassembled inbound message, from the receive loop's task. This is
    ///  a blocking call that holds up the receive loop; non-trivial work should be offloaded to
    ///  asynchronous processing, but that is the implementation's decision.
    async fn on_receive(&self, channel_id: u8, message: Bytes);

    /// called at most once per connection, when it tears down on an I/O fault, a protocol
    ///  violation or a panic in one of its loops. The connection is already stopping when this
    ///  fires; it is the upper layer's decision whether to drop the peer for good.
    async fn on_error(&self, error: anyhow::Error);
}
