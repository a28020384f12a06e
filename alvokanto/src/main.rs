use konkurso::config::{Config, ConfigError};
use konkurso::import_contest::{import_contest, ImportContestError};
use konkurso::language::get_supported_languages;
use konkurso::models::SubmissionId;
use konkurso::scoreboard::rank_contest;
use konkurso::store::StoreError;
use konkurso::{Judge, SubmissionRunner, SubmissionStore, WorkerPool};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    ImportContest(#[from] ImportContestError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("job queue closed before submission {0} was queued")]
    QueueClosed(SubmissionId),
}

async fn judge_contest(contest_dir: PathBuf) -> Result<(), Error> {
    let config = Config::from_env()?;
    log::info!("Using {:?} sandbox with {} workers", config.sandbox, config.workers);

    let supported_languages = get_supported_languages();
    log::info!("Loaded {} supported languages", supported_languages.len());
    for (key, language) in supported_languages.iter() {
        log::trace!("Supported language {} ({}): {}", key, language.order, language.name);
    }

    let (store, contest_id) = import_contest(&contest_dir)?;
    let store = Arc::new(store);
    let runner = SubmissionRunner::new(config.sandbox()?, supported_languages, &config);
    let judge = Arc::new(Judge::new(store.clone(), runner));

    let mut verdicts = judge.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = verdicts.recv().await {
            log::info!(
                "Team {} problem {}: {}",
                event.team_id, event.problem_id, event.status
            );
        }
    });

    let pool = WorkerPool::spawn(judge, config.workers);
    let (mut queued, mut awaiting_review) = (0, 0);
    for submission in store.submissions(contest_id)? {
        if submission.status.is_terminal() {
            continue;
        }
        // already ran once, only a review can settle it
        if store.result(submission.id)?.is_some() {
            awaiting_review += 1;
            continue;
        }
        pool.enqueue(submission.id)
            .await
            .map_err(|e| Error::QueueClosed(e.0))?;
        queued += 1;
    }
    log::info!(
        "Queued {} pending submissions, {} awaiting review",
        queued, awaiting_review
    );
    pool.join().await;

    print!("{}", rank_contest(&*store, contest_id, config.penalty_minutes)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let contest_dir = match std::env::args_os().nth(1) {
        Some(contest_dir) => PathBuf::from(contest_dir),
        None => {
            eprintln!("usage: alvokanto <contest directory>");
            exit(2);
        }
    };

    if let Err(e) = judge_contest(contest_dir).await {
        log::error!("{}", e);
        exit(1);
    }
}
