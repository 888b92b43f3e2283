use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// upper limit for the payload of a single message packet - bigger messages are sliced into
    ///  several packets
    pub max_packet_size: usize,
    /// number of packets the send loop emits per wake-up before yielding back to the scheduler
    pub num_batch_packets: usize,

    pub min_read_buffer_size: usize,
    pub min_write_buffer_size: usize,

    /// upper bound for the delay between a write into the buffered writer and the flush that
    ///  commits it to the transport
    pub flush_throttle: Duration,
    /// interval without inbound traffic after which a ping is sent to probe the peer
    pub ping_interval: Duration,
    /// cadence of the exponential decay of per-channel send statistics
    pub stats_interval: Duration,

    /// initial send cap in bytes per second; can be retuned at runtime
    pub send_rate: i64,
    /// initial receive cap in bytes per second; can be retuned at runtime
    pub recv_rate: i64,

    /// per-channel depth of the queue of complete outbound messages
    pub send_queue_capacity: usize,
    /// initial capacity of a channel's reassembly buffer
    pub recv_buffer_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            max_packet_size: 1024,
            num_batch_packets: 10,
            min_read_buffer_size: 1024,
            min_write_buffer_size: 1024,
            flush_throttle: Duration::from_millis(50),
            ping_interval: Duration::from_secs(120),
            stats_interval: Duration::from_secs(2),
            send_rate: 51_200,
            recv_rate: 51_200,
            send_queue_capacity: 1,
            recv_buffer_capacity: 4096,
        }
    }
}
