use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

/// Coalescing one-shot timer: [ThrottleTimer::set] arms it, and `throttle` later it fires once,
///  no matter how often it was armed in between. Used to bound the delay between a write into
///  the buffered writer and the flush that commits it, without flushing per write.
pub struct ThrottleTimer {
    trigger: mpsc::Sender<()>,
    fired: mpsc::Receiver<()>,
    task: JoinHandle<()>,
}

impl ThrottleTimer {
    pub fn new(throttle: Duration) -> ThrottleTimer {
        let (trigger, mut trigger_recv) = mpsc::channel::<()>(1);
        let (fired_send, fired) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            while trigger_recv.recv().await.is_some() {
                time::sleep(throttle).await;
                // triggers that arrived during the countdown collapse into this firing
                while trigger_recv.try_recv().is_ok() {}
                if fired_send.send(()).await.is_err() {
                    break;
                }
            }
        });

        ThrottleTimer { trigger, fired, task }
    }

    /// Arms the timer. A no-op while it is already armed.
    pub fn set(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Resolves when the timer fires. Cancel-safe, for use in `select!`.
    pub async fn fired(&mut self) -> Option<()> {
        self.fired.recv().await
    }
}

impl Drop for ThrottleTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}


/// Periodic timer whose ticks are consumed from a capacity-1 channel (ticks that pile up while
///  the consumer is busy coalesce). [RepeatTimer::reset_handle] hands out a cheap handle that
///  restarts the current period from another task without ticking.
pub struct RepeatTimer {
    reset: mpsc::Sender<()>,
    tick: mpsc::Receiver<()>,
    task: JoinHandle<()>,
}

impl RepeatTimer {
    pub fn new(period: Duration) -> RepeatTimer {
        let (reset, mut reset_recv) = mpsc::channel::<()>(1);
        let (tick_send, tick) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = time::sleep(period) => {
                        let _ = tick_send.try_send(());
                    }
                    r = reset_recv.recv() => {
                        if r.is_none() {
                            break;
                        }
                        // falling through restarts the sleep
                    }
                }
            }
        });

        RepeatTimer { reset, tick, task }
    }

    pub fn reset_handle(&self) -> RepeatTimerHandle {
        RepeatTimerHandle(self.reset.clone())
    }

    /// Resolves on the next tick. Cancel-safe, for use in `select!`.
    pub async fn tick(&mut self) -> Option<()> {
        self.tick.recv().await
    }
}

impl Drop for RepeatTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Clone)]
pub struct RepeatTimerHandle(mpsc::Sender<()>);

impl RepeatTimerHandle {
    /// Restarts the timer's current period. Non-blocking; resets that pile up while the timer
    ///  task is busy coalesce.
    pub fn reset(&self) {
        let _ = self.0.try_send(());
    }
}
