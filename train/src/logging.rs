//! Data logging toolkit.

use crate::{common::*, evaluate::ValidationReport, session::EpochSummary};
use async_std::{fs::File, io::BufWriter};

pub use logging_message::*;
pub use logging_worker::*;

mod logging_worker {
    use super::*;

    /// The data logging worker.
    #[derive(Debug)]
    pub struct LoggingWorker {
        event_writer: EventAsyncWriter<BufWriter<File>>,
        rx: broadcast::Receiver<LoggingMessage>,
    }

    impl LoggingWorker {
        /// Create a data logging worker.
        async fn new(logging_dir: &Path, rx: broadcast::Receiver<LoggingMessage>) -> Result<Self> {
            // prepare dirs
            let event_dir = logging_dir.join("events");
            let event_path_prefix = event_dir
                .join("cbam-rpn")
                .to_str()
                .ok_or_else(|| format_err!("non-UTF-8 logging path '{}'", event_dir.display()))?
                .to_owned();

            tokio::fs::create_dir_all(&event_dir).await?;

            let event_writer = EventAsyncWriter::from_prefix(event_path_prefix, "", EventWriterConfig::default())
                .await?;

            Ok(Self { event_writer, rx })
        }

        /// Start the data logging worker.
        async fn start(mut self) -> Result<()> {
            loop {
                let LoggingMessage { tag, kind } = match self.rx.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match kind {
                    LoggingMessageKind::TrainingStep(msg) => {
                        self.log_training_step(&tag, msg).await?;
                    }
                    LoggingMessageKind::Epoch(summary) => {
                        self.log_epoch(&tag, summary).await?;
                    }
                    LoggingMessageKind::Validation { epoch, report } => {
                        self.log_validation(&tag, epoch, report).await?;
                    }
                }
            }

            Ok(())
        }

        async fn write_scalar(&mut self, tag: String, step: usize, value: f64) -> Result<()> {
            self.event_writer
                .write_scalar(tag, step as i64, value as f32)
                .await?;
            Ok(())
        }

        async fn log_training_step(&mut self, tag: &str, msg: TrainingStepLog) -> Result<()> {
            let TrainingStepLog {
                step,
                lr,
                total_loss,
                classification_loss,
                weighted_regression_loss,
                recall,
            } = msg;

            self.write_scalar(format!("{}/params/learning_rate", tag), step, lr)
                .await?;
            self.write_scalar(format!("{}/loss/total_loss", tag), step, total_loss)
                .await?;
            self.write_scalar(
                format!("{}/loss/classification_loss", tag),
                step,
                classification_loss,
            )
            .await?;
            self.write_scalar(
                format!("{}/loss/regression_loss", tag),
                step,
                weighted_regression_loss,
            )
            .await?;
            if let Some(recall) = recall {
                self.write_scalar(format!("{}/metric/recall", tag), step, recall)
                    .await?;
            }

            Ok(())
        }

        async fn log_epoch(&mut self, tag: &str, summary: EpochSummary) -> Result<()> {
            let epoch = summary.epoch;

            self.write_scalar(format!("{}/loss/total_loss", tag), epoch, summary.mean_loss)
                .await?;
            self.write_scalar(
                format!("{}/loss/classification_loss", tag),
                epoch,
                summary.mean_classification_loss,
            )
            .await?;
            self.write_scalar(
                format!("{}/loss/regression_loss", tag),
                epoch,
                summary.mean_regression_loss,
            )
            .await?;
            if let (Some(recall), Some(error)) = (summary.mean_recall, summary.error()) {
                self.write_scalar(format!("{}/metric/recall", tag), epoch, recall)
                    .await?;
                self.write_scalar(format!("{}/metric/error", tag), epoch, error)
                    .await?;
            }

            Ok(())
        }

        async fn log_validation(
            &mut self,
            tag: &str,
            epoch: usize,
            report: ValidationReport,
        ) -> Result<()> {
            let ValidationReport {
                recall,
                error,
                mean_best_iou,
                ..
            } = report;
            let stats = [("recall", recall), ("error", error), ("avg_iou", mean_best_iou)];

            for (name, stat) in stats {
                if let Some(stat) = stat {
                    self.write_scalar(format!("{}/{}/mean", tag, name), epoch, stat.mean)
                        .await?;
                    self.write_scalar(format!("{}/{}/std", tag, name), epoch, stat.std)
                        .await?;
                }
            }

            Ok(())
        }
    }

    pub async fn logging_worker(
        logging_dir: Arc<Path>,
        rx: broadcast::Receiver<LoggingMessage>,
    ) -> Result<impl Future<Output = Result<()>> + Send> {
        let worker = LoggingWorker::new(&logging_dir, rx).await?;
        Ok(tokio::task::spawn(worker.start()).map(|result| Fallible::Ok(result??)))
    }
}

mod logging_message {
    use super::*;

    /// The message type that is accepted by the logging worker.
    #[derive(Debug, Clone)]
    pub struct LoggingMessage {
        pub tag: Cow<'static, str>,
        pub kind: LoggingMessageKind,
    }

    #[derive(Debug, Clone)]
    pub enum LoggingMessageKind {
        TrainingStep(TrainingStepLog),
        Epoch(EpochSummary),
        Validation {
            epoch: usize,
            report: ValidationReport,
        },
    }

    /// Scalars of one optimization step.
    #[derive(Debug, Clone, PartialEq)]
    pub struct TrainingStepLog {
        pub step: usize,
        pub lr: f64,
        pub total_loss: f64,
        pub classification_loss: f64,
        pub weighted_regression_loss: f64,
        pub recall: Option<f64>,
    }

    impl LoggingMessage {
        pub fn new_training_step<S>(tag: S, msg: TrainingStepLog) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::TrainingStep(msg),
            }
        }

        pub fn new_epoch<S>(tag: S, summary: EpochSummary) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::Epoch(summary),
            }
        }

        pub fn new_validation<S>(tag: S, epoch: usize, report: ValidationReport) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::Validation { epoch, report },
            }
        }
    }
}
