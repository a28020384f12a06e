use async_channel::{Receiver, SendError, Sender};
use futures::future::join_all;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::task::{self, JoinHandle};

use crate::judge::Judge;
use crate::models::SubmissionId;
use crate::store::SubmissionStore;

/// Fixed set of workers judging queued submissions, at most one sandbox run
/// per worker at a time.
pub struct WorkerPool {
    job_sender: Sender<SubmissionId>,
    workers: Vec<JoinHandle<()>>,
}

async fn work<S>(worker: usize, judge: Arc<Judge<S>>, job_receiver: Receiver<SubmissionId>)
where
    S: SubmissionStore + ?Sized + 'static,
{
    while let Ok(id) = job_receiver.recv().await {
        let judge = judge.clone();
        match task::spawn_blocking(move || judge.judge(id)).await {
            Ok(Ok(verdict)) => info!(
                "Worker {} finished submission {}: {}",
                worker, id, verdict.status
            ),
            Ok(Err(e)) if e.is_infrastructure() => {
                error!("Worker {} left submission {} pending: {}", worker, id, e)
            }
            Ok(Err(e)) => warn!("Worker {} skipped submission {}: {}", worker, id, e),
            Err(e) => error!("Worker {} crashed on submission {}: {}", worker, id, e),
        }
    }
    info!("Worker {} stopped", worker);
}

impl WorkerPool {
    /// Starts `workers` workers on the current tokio runtime.
    pub fn spawn<S>(judge: Arc<Judge<S>>, workers: usize) -> WorkerPool
    where
        S: SubmissionStore + ?Sized + 'static,
    {
        let (job_sender, job_receiver) = async_channel::unbounded();
        let workers = (0..workers.max(1))
            .map(|worker| tokio::spawn(work(worker, judge.clone(), job_receiver.clone())))
            .collect();
        WorkerPool {
            job_sender,
            workers,
        }
    }

    pub async fn enqueue(&self, id: SubmissionId) -> Result<(), SendError<SubmissionId>> {
        self.job_sender.send(id).await
    }

    pub fn queued(&self) -> usize {
        self.job_sender.len()
    }

    /// Stops accepting jobs; queued ones still get judged.
    pub fn close(&self) {
        self.job_sender.close();
    }

    /// Closes the queue and waits for the workers to drain it.
    pub async fn join(self) {
        self.close();
        for result in join_all(self.workers).await {
            if let Err(e) = result {
                error!("Worker task failed: {}", e);
            }
        }
    }
}
