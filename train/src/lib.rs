//! The training program of the CBAM region proposal network.

pub mod common;
pub mod config;
pub mod evaluate;
pub mod logging;
pub mod session;
pub mod train;
pub mod utils;

use crate::common::*;

/// The entry of training program.
pub async fn start(config: Arc<config::Config>) -> Result<()> {
    let start_time = Local::now();
    let logging_dir: Arc<Path> = {
        let dir = config
            .logging
            .dir
            .join(format!("{}", start_time.format(utils::FILE_STRFTIME)));
        dir.into_boxed_path().into()
    };
    let checkpoint_dir: Arc<Path> = logging_dir.join("checkpoints").into_boxed_path().into();

    // create dirs and save config
    {
        tokio::fs::create_dir_all(&*logging_dir).await?;
        tokio::fs::create_dir_all(&*checkpoint_dir).await?;
        let path = logging_dir.join("config.json5");
        let text = serde_json::to_string_pretty(&*config)?;
        tokio::fs::write(&path, text).await?;
    }
    info!("logging to '{}'", logging_dir.display());

    // create channels
    let (logging_tx, logging_rx) = broadcast::channel(16);

    // start logger
    let logging_future = logging::logging_worker(logging_dir.clone(), logging_rx).await?;

    // training worker
    let training_worker_future = {
        let config = config.clone();
        let checkpoint_dir = checkpoint_dir.clone();

        tokio::task::spawn_blocking(move || {
            train::training_worker(config, checkpoint_dir, logging_tx)
        })
        .map(|result| Fallible::Ok(result??))
    };

    futures::try_join!(training_worker_future, logging_future)?;

    Ok(())
}
