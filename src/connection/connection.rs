use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::connection::channel::{new_channel, ChannelDescriptor, ChannelState, RecvChannel, SendChannel};
use crate::connection::config::ConnectionConfig;
use crate::connection::handler::ConnectionHandler;
use crate::connection::packet::{read_packet, PacketType};
use crate::connection::rate::RateMonitor;
use crate::connection::timer::{RepeatTimer, RepeatTimerHandle, ThrottleTimer};

/// A connection multiplexes messages from an arbitrary number of channels over a single reliable
///  byte stream, with buffering, pacing and liveness pings. Outbound messages are enqueued with
///  [Connection::send] / [Connection::try_send]; every completed inbound message is handed to the
///  [ConnectionHandler].
///
/// [Connection::start] spawns one send loop and one receive loop. The loops own all per-channel
///  transmission state exclusively, so the hot path is lock-free; callers only touch the
///  channels' bounded queues and a handful of atomics.
pub struct Connection<S> {
    shared: Arc<ConnectionShared>,
    loops: Mutex<Option<(SendLoop<S>, RecvLoop<S>)>>,
}

impl<S> Debug for Connection<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{channels:{:02X?}}}", self.shared.channel_ids)
    }
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> Connection<S> {
    /// Sets up a connection on `stream` with the given channels. No I/O happens before
    ///  [Connection::start]. Fails on a duplicate channel id or a zero priority.
    ///
    /// Must be called in the context of a tokio runtime.
    pub fn new(
        stream: S,
        channel_descriptors: &[ChannelDescriptor],
        handler: Arc<dyn ConnectionHandler>,
        config: ConnectionConfig,
    ) -> anyhow::Result<Connection<S>> {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = BufReader::with_capacity(config.min_read_buffer_size, read_half);
        let writer = BufWriter::with_capacity(config.min_write_buffer_size, write_half);

        let mut channel_ids = Vec::new();
        let mut channels_idx = FxHashMap::default();
        let mut send_channels = Vec::new();
        let mut recv_channels = FxHashMap::default();
        for desc in channel_descriptors {
            let (state, send_channel, recv_channel) = new_channel(desc, &config)?;
            if channels_idx.insert(desc.id, state).is_some() {
                return Err(anyhow!("duplicate channel id {:#04x}", desc.id));
            }
            channel_ids.push(desc.id);
            send_channels.push(send_channel);
            recv_channels.insert(desc.id, recv_channel);
        }

        // capacity 1 plus try_send makes both signals coalescing: any number of producers
        //  collapse into a single pending wake / pong
        let (wake, wake_recv) = mpsc::channel(1);
        let (pong, pong_recv) = mpsc::channel(1);
        let (quit, _) = broadcast::channel(1);

        let ping_timer = RepeatTimer::new(config.ping_interval);
        let ping_reset = ping_timer.reset_handle();
        let flush_timer = ThrottleTimer::new(config.flush_throttle);
        let stats_timer = RepeatTimer::new(config.stats_interval);

        let shared = Arc::new(ConnectionShared {
            send_rate: AtomicI64::new(config.send_rate),
            recv_rate: AtomicI64::new(config.recv_rate),
            config,
            channel_ids,
            channels_idx,
            handler,
            wake,
            quit: quit.clone(),
            started: AtomicU32::new(0),
            stopped: AtomicU32::new(0),
            errored: AtomicU32::new(0),
        });

        let send_loop = SendLoop {
            shared: shared.clone(),
            writer,
            channels: send_channels,
            send_monitor: RateMonitor::new(),
            flush_timer,
            ping_timer,
            stats_timer,
            wake: wake_recv,
            pong: pong_recv,
            quit: quit.subscribe(),
        };
        let recv_loop = RecvLoop {
            shared: shared.clone(),
            reader,
            channels: recv_channels,
            recv_monitor: RateMonitor::new(),
            pong,
            ping_reset,
            quit: quit.subscribe(),
        };

        Ok(Connection {
            shared,
            loops: Mutex::new(Some((send_loop, recv_loop))),
        })
    }

    /// Begins multiplexing. Idempotent: the loops are spawned exactly once no matter how often
    ///  this is called.
    pub fn start(&self) {
        if self.shared.started.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }

        let loops = self.loops.lock()
            .expect("loop state lock poisoned")
            .take();
        let Some((send_loop, recv_loop)) = loops else {
            return;
        };

        debug!("starting {:?}", self);
        spawn_supervised("send loop", self.shared.clone(), send_loop.run());
        spawn_supervised("receive loop", self.shared.clone(), recv_loop.run());
    }

    /// Stops the connection: signals both loops to exit, which drops the transport halves and
    ///  halts all timers. Idempotent, and safe to call from anywhere.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Enqueues a message on a channel, waiting for queue space. Wakes the send loop. Returns
    ///  false if the connection is stopped or the channel id is unknown.
    pub async fn send(&self, channel_id: u8, msg: Bytes) -> bool {
        if self.shared.is_stopped() {
            return false;
        }
        let Some(channel) = self.shared.channels_idx.get(&channel_id) else {
            error!(channel_id, "cannot send bytes, unknown channel");
            return false;
        };

        trace!(channel_id, len = msg.len(), "enqueueing message");
        if !channel.send_bytes(msg).await {
            return false;
        }
        self.shared.wake_send_loop();
        true
    }

    /// Non-blocking variant of [Connection::send]; returns whether the message was accepted.
    pub async fn try_send(&self, channel_id: u8, msg: Bytes) -> bool {
        if self.shared.is_stopped() {
            return false;
        }
        let Some(channel) = self.shared.channels_idx.get(&channel_id) else {
            error!(channel_id, "cannot send bytes, unknown channel");
            return false;
        };

        let accepted = channel.try_send_bytes(msg);
        if accepted {
            self.shared.wake_send_loop();
        }
        accepted
    }

    /// Whether a channel's send queue has room. A heuristic for throttling higher layers, not a
    ///  guarantee that a subsequent send will not block.
    pub fn can_send(&self, channel_id: u8) -> bool {
        if self.shared.is_stopped() {
            return false;
        }
        match self.shared.channels_idx.get(&channel_id) {
            Some(channel) => channel.can_send(),
            None => {
                error!(channel_id, "unknown channel");
                false
            }
        }
    }

    pub fn load_send_queue_size(&self, channel_id: u8) -> Option<u32> {
        self.shared.channels_idx.get(&channel_id)
            .map(|channel| channel.load_send_queue_size())
    }

    /// Retunes the outbound rate cap (bytes per second). Takes effect on the next batch.
    pub fn set_send_rate(&self, rate_bps: i64) {
        self.shared.send_rate.store(rate_bps, Ordering::SeqCst);
    }

    /// Retunes the inbound rate cap (bytes per second). Takes effect on the next read.
    pub fn set_recv_rate(&self, rate_bps: i64) {
        self.shared.recv_rate.store(rate_bps, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst) == 1
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }
}

/// The part of a connection that is shared between its handle and its loops.
struct ConnectionShared {
    config: ConnectionConfig,
    channel_ids: Vec<u8>,
    channels_idx: FxHashMap<u8, Arc<ChannelState>>,
    handler: Arc<dyn ConnectionHandler>,
    wake: mpsc::Sender<()>,
    quit: broadcast::Sender<()>,
    send_rate: AtomicI64,
    recv_rate: AtomicI64,
    started: AtomicU32,
    stopped: AtomicU32,
    errored: AtomicU32,
}

impl ConnectionShared {
    fn wake_send_loop(&self) {
        let _ = self.wake.try_send(());
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) == 1
    }

    fn stop(&self) {
        if self.stopped.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            debug!("stopping connection");
            let _ = self.quit.send(());
        }
    }

    /// The single-shot fatal path: stops the connection and raises the error callback, which
    ///  fires at most once per connection no matter how many faults pile up during teardown.
    async fn stop_for_error(&self, error: anyhow::Error) {
        self.stop();
        if self.errored.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            self.handler.on_error(error).await;
        }
    }
}

/// Runs a loop behind a barrier that funnels both error returns and panics (typically I/O on a
///  half-closed stream) into the single-shot error path.
fn spawn_supervised<F>(name: &'static str, shared: Arc<ConnectionShared>, loop_future: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let task = tokio::spawn(loop_future);
    tokio::spawn(async move {
        match task.await {
            Ok(Ok(())) => {
                trace!("{} finished", name);
            }
            Ok(Err(e)) => {
                warn!("{} failed: {:#}", name, e);
                shared.stop_for_error(e).await;
            }
            Err(join_error) => {
                if join_error.is_panic() {
                    let payload = join_error.into_panic();
                    let msg = payload.downcast_ref::<&str>().map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    shared.stop_for_error(anyhow!("{} panicked: {}", name, msg)).await;
                }
            }
        }
    });
}

/// The send loop's exclusively owned state: the buffered write half, every channel's outbound
///  half, the pacer and the timers.
struct SendLoop<S> {
    shared: Arc<ConnectionShared>,
    writer: BufWriter<WriteHalf<S>>,
    channels: Vec<SendChannel>,
    send_monitor: RateMonitor,
    flush_timer: ThrottleTimer,
    ping_timer: RepeatTimer,
    stats_timer: RepeatTimer,
    wake: mpsc::Receiver<()>,
    pong: mpsc::Receiver<()>,
    quit: broadcast::Receiver<()>,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> SendLoop<S> {
    async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.flush_timer.fired() => {
                    self.flush().await;
                }
                _ = self.stats_timer.tick() => {
                    for channel in self.channels.iter_mut() {
                        channel.update_stats();
                    }
                }
                _ = self.ping_timer.tick() => {
                    debug!("sending ping");
                    if !self.send_signal_packet(PacketType::Ping).await {
                        break;
                    }
                }
                Some(()) = self.pong.recv() => {
                    debug!("sending pong");
                    if !self.send_signal_packet(PacketType::Pong).await {
                        break;
                    }
                }
                _ = self.quit.recv() => {
                    break;
                }
                Some(()) = self.wake.recv() => {
                    let exhausted = self.send_some_packets().await?;
                    if !exhausted {
                        // keep the loop awake, there is more to send
                        self.shared.wake_send_loop();
                    }
                }
            }

            if self.shared.is_stopped() {
                break;
            }
        }
        Ok(())
    }

    /// Writes a body-less ping/pong frame and flushes it out. Returns false if the loop should
    ///  exit because the transport failed.
    async fn send_signal_packet(&mut self, packet_type: PacketType) -> bool {
        if let Err(e) = self.writer.write_u8(packet_type.into()).await {
            if !self.shared.is_stopped() {
                info!("send loop failed writing {:?}: {}", packet_type, e);
                self.shared.stop();
            }
            return false;
        }
        self.send_monitor.update(1);
        self.flush().await;
        true
    }

    async fn flush(&mut self) {
        if let Err(e) = self.writer.flush().await {
            if !self.shared.is_stopped() {
                warn!("flush failed: {}", e);
            }
        }
    }

    /// Emits up to a batch of packets, first parking on the send monitor until at least one
    ///  packet's worth of budget is available. Returns true iff the channels ran dry.
    async fn send_some_packets(&mut self) -> anyhow::Result<bool> {
        let send_rate = self.shared.send_rate.load(Ordering::SeqCst);
        self.send_monitor.limit(self.shared.config.max_packet_size, send_rate, true).await;

        for _ in 0..self.shared.config.num_batch_packets {
            if self.send_packet().await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Emits one packet from the pending channel with the smallest `recently_sent / priority`
    ///  ratio (ties go to the channel declared first). Returns true iff no channel had anything
    ///  to send.
    async fn send_packet(&mut self) -> anyhow::Result<bool> {
        let mut least_ratio = f32::MAX;
        let mut least_idx = None;
        for (idx, channel) in self.channels.iter_mut().enumerate() {
            if !channel.is_send_pending() {
                continue;
            }
            let ratio = channel.recently_sent as f32 / channel.state.priority as f32;
            if ratio < least_ratio {
                least_ratio = ratio;
                least_idx = Some(idx);
            }
        }

        let Some(idx) = least_idx else {
            return Ok(true);
        };

        let channel = &mut self.channels[idx];
        let n = channel.write_packet_to(&mut self.writer).await
            .map_err(|e| e.context("failed to write packet"))?;

        self.send_monitor.update(n);
        self.flush_timer.set();
        Ok(false)
    }
}

/// The receive loop's exclusively owned state: the buffered read half, every channel's
///  reassembly half, and the pacer.
struct RecvLoop<S> {
    shared: Arc<ConnectionShared>,
    reader: BufReader<ReadHalf<S>>,
    channels: FxHashMap<u8, RecvChannel>,
    recv_monitor: RateMonitor,
    pong: mpsc::Sender<()>,
    ping_reset: RepeatTimerHandle,
    quit: broadcast::Receiver<()>,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> RecvLoop<S> {
    async fn run(mut self) -> anyhow::Result<()> {
        loop {
            let recv_rate = self.shared.recv_rate.load(Ordering::SeqCst);
            self.recv_monitor.limit(self.shared.config.max_packet_size, recv_rate, true).await;

            let raw_type = tokio::select! {
                r = self.reader.read_u8() => match r {
                    Ok(byte) => byte,
                    Err(e) => {
                        if !self.shared.is_stopped() {
                            info!("receive loop failed reading packet type: {}", e);
                            self.shared.stop();
                        }
                        break;
                    }
                },
                _ = self.quit.recv() => break,
            };
            self.recv_monitor.update(1);

            match PacketType::try_from(raw_type) {
                Ok(PacketType::Ping) => {
                    trace!("received ping");
                    // TODO throttle pong replies - a peer flooding pings causes a flush per pong
                    let _ = self.pong.try_send(());
                }
                Ok(PacketType::Pong) => {
                    trace!("received pong");
                }
                Ok(PacketType::Message) => {
                    if !self.recv_message_packet().await? {
                        break;
                    }
                }
                Err(_) => {
                    return Err(anyhow!("unknown packet type {:#04x}", raw_type));
                }
            }

            // inbound traffic is proof of liveness, so every received packet restarts the ping
            //  period over in the send loop
            self.ping_reset.reset();
        }

        // dropping self releases the pong sender; the send loop's pong branch goes quiet instead
        //  of faulting
        Ok(())
    }

    /// Reads one message packet and routes it to its channel, dispatching the reassembled
    ///  message if the packet completes one. Returns false if the loop should exit quietly; a
    ///  protocol violation is returned as an error.
    async fn recv_message_packet(&mut self) -> anyhow::Result<bool> {
        let max_packet_size = self.shared.config.max_packet_size;
        let (packet, n) = tokio::select! {
            r = read_packet(&mut self.reader, max_packet_size) => match r {
                Ok(result) => result,
                Err(e) => {
                    if e.downcast_ref::<std::io::Error>().is_none() {
                        // not a transport fault but a malformed frame
                        return Err(e);
                    }
                    if !self.shared.is_stopped() {
                        info!("receive loop failed reading message packet: {:#}", e);
                        self.shared.stop();
                    }
                    return Ok(false);
                }
            },
            _ = self.quit.recv() => return Ok(false),
        };
        self.recv_monitor.update(n);

        let channel_id = packet.channel_id;
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return Err(anyhow!("received packet for unknown channel {:#04x}", channel_id));
        };

        if let Some(message) = channel.recv_packet(packet) {
            trace!(channel_id, len = message.len(), "dispatching reassembled message");
            self.shared.handler.on_receive(channel_id, message).await;
        }
        Ok(true)
    }
}
