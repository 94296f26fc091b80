use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::WorkerError;

/// A unit of work for a [`Worker`]. When requests queue up faster than the
/// worker drains them, only the newest is run; `supersede` decides what of the
/// older request carries over.
pub trait Job: Send + 'static {
    fn supersede(self, newer: Self) -> Self
    where
        Self: Sized,
    {
        newer
    }
}

#[derive(Debug)]
pub struct Tagged<T> {
    pub request_id: u64,
    pub payload: T,
}

/// A dedicated thread reached only through request/response messages.
pub struct Worker<Req> {
    name: &'static str,
    requests: std_mpsc::Sender<Tagged<Req>>,
}

impl<Req: Job> Worker<Req> {
    pub fn spawn<Resp, F>(
        name: &'static str,
        mut handler: F,
        responses: mpsc::UnboundedSender<Tagged<Resp>>,
    ) -> Result<Self, WorkerError>
    where
        Resp: Send + 'static,
        F: FnMut(Req) -> Resp + Send + 'static,
    {
        let (requests, inbox) = std_mpsc::channel::<Tagged<Req>>();

        thread::Builder::new()
            .name(format!("{name}-worker"))
            .spawn(move || {
                while let Ok(mut job) = inbox.recv() {
                    while let Ok(newer) = inbox.try_recv() {
                        debug!(worker = name, skipped = job.request_id, "superseded request skipped");
                        job = Tagged {
                            request_id: newer.request_id,
                            payload: job.payload.supersede(newer.payload),
                        };
                    }

                    let started = Instant::now();
                    let payload = handler(job.payload);
                    trace!(worker = name, request_id = job.request_id, elapsed = ?started.elapsed(), "request done");

                    let response = Tagged {
                        request_id: job.request_id,
                        payload,
                    };
                    if responses.send(response).is_err() {
                        break;
                    }
                }
                debug!(worker = name, "worker stopped");
            })
            .map_err(|source| WorkerError::Spawn { name, source })?;

        Ok(Self { name, requests })
    }

    pub fn submit(&self, request_id: u64, payload: Req) -> Result<(), WorkerError> {
        self.requests
            .send(Tagged {
                request_id,
                payload,
            })
            .map_err(|_| WorkerError::Gone { name: self.name })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use super::*;

    impl Job for u32 {}

    #[derive(Debug)]
    struct Flagged {
        value: u32,
        flag: bool,
    }

    impl Job for Flagged {
        fn supersede(self, newer: Self) -> Self {
            Flagged {
                value: newer.value,
                flag: self.flag || newer.flag,
            }
        }
    }

    #[tokio::test]
    async fn responses_carry_the_request_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = Worker::spawn("double", |value: u32| value * 2, tx).unwrap();

        worker.submit(7, 21).unwrap();
        let response = rx.recv().await.unwrap();
        assert_eq!(response.request_id, 7);
        assert_eq!(response.payload, 42);
    }

    #[tokio::test]
    async fn queued_requests_collapse_to_the_newest() {
        let started = Arc::new(Barrier::new(2));
        let gate = Arc::new(Barrier::new(2));
        let (worker_started, worker_gate) = (Arc::clone(&started), Arc::clone(&gate));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = Worker::spawn(
            "gated",
            move |job: Flagged| {
                if job.value == 0 {
                    worker_started.wait();
                    worker_gate.wait();
                }
                (job.value, job.flag)
            },
            tx,
        )
        .unwrap();

        worker.submit(1, Flagged { value: 0, flag: false }).unwrap();
        started.wait();
        worker.submit(2, Flagged { value: 1, flag: true }).unwrap();
        worker.submit(3, Flagged { value: 2, flag: false }).unwrap();
        worker.submit(4, Flagged { value: 3, flag: false }).unwrap();
        gate.wait();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.request_id, 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.request_id, 4);
        assert_eq!(second.payload, (3, true));
    }

    #[tokio::test]
    async fn panicking_worker_reports_gone() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Tagged<u32>>();
        let worker = Worker::spawn("broken", |_: u32| -> u32 { panic!("boom") }, tx).unwrap();

        worker.submit(1, 1).unwrap();
        assert!(rx.recv().await.is_none());

        let mut result = worker.submit(2, 2);
        for _ in 0..50 {
            if result.is_err() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            result = worker.submit(2, 2);
        }
        assert!(matches!(result, Err(WorkerError::Gone { name: "broken" })));
    }
}
