use std::cmp::min;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::trace;

use crate::connection::config::ConnectionConfig;
use crate::connection::packet::{Packet, PacketType, EOF_NO, EOF_YES};

/// Static description of one channel of a connection: its wire id and its scheduling weight.
///  Higher priority means a bigger share of the connection's bandwidth under contention.
#[derive(Debug, Clone)]
pub struct ChannelDescriptor {
    pub id: u8,
    /// strictly positive
    pub priority: u32,
}

/// The half of a channel that is safe to use from arbitrary tasks: enqueueing outbound messages
///  and the bookkeeping around it. Everything else lives in [SendChannel] / [RecvChannel], each
///  owned exclusively by one of the connection's loops.
pub struct ChannelState {
    pub id: u8,
    pub priority: u32,
    send_queue_capacity: usize,
    send_queue: mpsc::Sender<Bytes>,
    /// messages enqueued but not yet fully transmitted - decremented only when a message's EOF
    ///  packet is cut
    send_queue_size: AtomicU32,
}

impl ChannelState {
    /// Enqueues a complete outbound message, waiting for queue space. Returns false if the
    ///  connection's send loop is gone.
    pub async fn send_bytes(&self, bytes: Bytes) -> bool {
        if self.send_queue.send(bytes).await.is_err() {
            return false;
        }
        self.send_queue_size.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Non-blocking enqueue; returns whether the message was accepted.
    pub fn try_send_bytes(&self, bytes: Bytes) -> bool {
        match self.send_queue.try_send(bytes) {
            Ok(()) => {
                self.send_queue_size.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }

    pub fn load_send_queue_size(&self) -> u32 {
        self.send_queue_size.load(Ordering::SeqCst)
    }

    /// Use only as a heuristic: the answer can be stale by the time the caller acts on it.
    pub fn can_send(&self) -> bool {
        (self.load_send_queue_size() as usize) < self.send_queue_capacity
    }

    fn decrement_send_queue_size(&self) {
        self.send_queue_size.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A channel's outbound state, owned exclusively by the send loop.
pub struct SendChannel {
    pub state: Arc<ChannelState>,
    send_queue: mpsc::Receiver<Bytes>,
    /// the message currently being sliced into packets; empty iff nothing is mid-transmission
    sending: Bytes,
    /// exponential moving average of bytes recently sent; `recently_sent / priority` is the
    ///  scheduling key, smallest goes first
    pub recently_sent: i64,
    max_packet_size: usize,
}

impl SendChannel {
    /// Returns whether there is anything to cut a packet from, pulling the next queued message
    ///  into `sending` if none is mid-transmission. Despite the name this *consumes* from the
    ///  queue (peek-or-pull); `sending` keeps the pulled message until its EOF packet is cut.
    pub fn is_send_pending(&mut self) -> bool {
        if self.sending.is_empty() {
            match self.send_queue.try_recv() {
                Ok(bytes) => {
                    self.sending = bytes;
                    true
                }
                Err(_) => false,
            }
        } else {
            true
        }
    }

    /// Cuts the next packet from `sending`. Call only after [SendChannel::is_send_pending]
    ///  returned true.
    fn next_packet(&mut self) -> Packet {
        let cut = min(self.max_packet_size, self.sending.len());
        let bytes = self.sending.split_to(cut);

        let eof = if self.sending.is_empty() {
            self.state.decrement_send_queue_size();
            EOF_YES
        } else {
            EOF_NO
        };

        Packet { channel_id: self.state.id, eof, bytes }
    }

    /// Writes the message type byte plus one packet to `writer`, returning the number of bytes
    ///  written. On success the written bytes are credited to `recently_sent`.
    pub async fn write_packet_to<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> anyhow::Result<usize> {
        let packet = self.next_packet();
        trace!(channel_id = self.state.id, ?packet, "writing packet");

        let mut buf = BytesMut::with_capacity(packet.bytes.len() + 8);
        buf.put_u8(PacketType::Message.into());
        packet.ser(&mut buf);

        writer.write_all(&buf).await?;

        self.recently_sent += buf.len() as i64;
        Ok(buf.len())
    }

    /// Decays the moving average. The connection calls this at its stats interval.
    pub fn update_stats(&mut self) {
        self.recently_sent = (self.recently_sent as f64 * 0.5) as i64;
    }
}

/// A channel's inbound state, owned exclusively by the receive loop.
pub struct RecvChannel {
    pub id: u8,
    /// reassembly buffer for the message currently arriving on this channel
    recving: BytesMut,
    recv_buffer_capacity: usize,
}

impl RecvChannel {
    /// Appends a packet's payload to the reassembly buffer. Returns the complete message if the
    ///  packet carried the EOF marker.
    pub fn recv_packet(&mut self, packet: Packet) -> Option<Bytes> {
        self.recving.extend_from_slice(&packet.bytes);

        if packet.eof == EOF_YES {
            let assembled = std::mem::replace(&mut self.recving, BytesMut::with_capacity(self.recv_buffer_capacity));
            Some(assembled.freeze())
        } else {
            None
        }
    }
}

/// Creates the three ownership halves of a channel. The shared half goes into the connection's
///  index, the other two move into the send and receive loops.
pub fn new_channel(desc: &ChannelDescriptor, config: &ConnectionConfig) -> anyhow::Result<(Arc<ChannelState>, SendChannel, RecvChannel)> {
    if desc.priority == 0 {
        return Err(anyhow!("channel {:#04x}: priority must be a positive integer", desc.id));
    }

    let (send_queue, send_queue_recv) = mpsc::channel(config.send_queue_capacity);

    let state = Arc::new(ChannelState {
        id: desc.id,
        priority: desc.priority,
        send_queue_capacity: config.send_queue_capacity,
        send_queue,
        send_queue_size: AtomicU32::new(0),
    });

    let send_channel = SendChannel {
        state: state.clone(),
        send_queue: send_queue_recv,
        sending: Bytes::new(),
        recently_sent: 0,
        max_packet_size: config.max_packet_size,
    };

    let recv_channel = RecvChannel {
        id: desc.id,
        recving: BytesMut::with_capacity(config.recv_buffer_capacity),
        recv_buffer_capacity: config.recv_buffer_capacity,
    };

    Ok((state, send_channel, recv_channel))
}
