// Copyright 2025-2026 CEMAXECUTER LLC

//! Block handoff between a producer thread and a consumer thread.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;

/// Maximum number of samples carried by one stream block.
pub const STREAM_BUFFER_SIZE: usize = 1_000_000;

/// One-shot stop signal that can be re-armed.
///
/// Triggering drops the sender, which disconnects every clone of the
/// receiver and wakes any `select!` waiting on it.
struct StopSignal {
    tx: Mutex<Option<Sender<()>>>,
    rx: Mutex<Receiver<()>>,
}

impl StopSignal {
    fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
        }
    }

    fn receiver(&self) -> Receiver<()> {
        self.rx.lock().unwrap().clone()
    }

    fn is_triggered(rx: &Receiver<()>) -> bool {
        matches!(rx.try_recv(), Err(channel::TryRecvError::Disconnected))
    }

    fn trigger(&self) {
        self.tx.lock().unwrap().take();
    }

    fn clear(&self) {
        let (tx, rx) = channel::bounded(0);
        *self.rx.lock().unwrap() = rx;
        *self.tx.lock().unwrap() = Some(tx);
    }
}

/// Single-producer/single-consumer stream of sample blocks.
///
/// `write` blocks while the previous block is still unread, which gives the
/// producer the same back-pressure a double buffer would.
pub struct Stream<T> {
    tx: Sender<Vec<T>>,
    rx: Receiver<Vec<T>>,
    write_stop: StopSignal,
    read_stop: StopSignal,
}

impl<T: Send> Stream<T> {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(1);
        Self {
            tx,
            rx,
            write_stop: StopSignal::new(),
            read_stop: StopSignal::new(),
        }
    }

    /// Hand a block to the consumer. Returns false once the writer was stopped.
    pub fn write(&self, block: Vec<T>) -> bool {
        let stop = self.write_stop.receiver();
        if StopSignal::is_triggered(&stop) {
            return false;
        }
        select! {
            send(self.tx, block) -> res => res.is_ok(),
            recv(stop) -> _ => false,
        }
    }

    /// Wait for the next block. Returns None once the reader was stopped.
    pub fn read(&self) -> Option<Vec<T>> {
        let stop = self.read_stop.receiver();
        if StopSignal::is_triggered(&stop) {
            return None;
        }
        select! {
            recv(self.rx) -> block => block.ok(),
            recv(stop) -> _ => None,
        }
    }

    pub fn stop_writer(&self) {
        self.write_stop.trigger();
    }

    pub fn clear_write_stop(&self) {
        self.write_stop.clear();
    }

    pub fn stop_reader(&self) {
        self.read_stop.trigger();
    }

    pub fn clear_read_stop(&self) {
        self.read_stop.clear();
    }
}

impl<T: Send> Default for Stream<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a handler on every block read from a stream, on its own thread.
pub struct HandlerSink<T: Send + 'static> {
    stream: Arc<Stream<T>>,
    handler: Arc<Mutex<Box<dyn FnMut(&[T]) + Send>>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> HandlerSink<T> {
    pub fn new<F>(stream: Arc<Stream<T>>, handler: F) -> Self
    where
        F: FnMut(&[T]) + Send + 'static,
    {
        Self {
            stream,
            handler: Arc::new(Mutex::new(Box::new(handler))),
            worker: None,
        }
    }

    pub fn start(&mut self) -> std::io::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let stream = Arc::clone(&self.stream);
        let handler = Arc::clone(&self.handler);
        let worker = thread::Builder::new()
            .name("handler-sink".to_string())
            .spawn(move || {
                while let Some(block) = stream.read() {
                    (handler.lock().unwrap())(&block);
                }
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.stream.stop_reader();
            let _ = worker.join();
            self.stream.clear_read_stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl<T: Send + 'static> Drop for HandlerSink<T> {
    fn drop(&mut self) {
        self.stop();
    }
}
