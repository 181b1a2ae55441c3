//! The training worker.

use crate::{
    common::*,
    config::{Config, DatasetConfig, TrainingConfig},
    evaluate::{self, ValidationReport},
    logging::{LoggingMessage, TrainingStepLog},
    session::{EpochSummary, TrainingSession, TrainingSessionInit},
};

/// Loads the image dataset described by the configuration.
pub fn load_dataset(config: &DatasetConfig) -> Result<ImageDataset> {
    let DatasetConfig {
        image_dir,
        label_file,
        max_labels,
        cache_dir,
        image_h,
        image_w,
        ..
    } = config;

    let labels = LabelIndex::new(load_label_file(label_file, *max_labels)?);
    let loader = CacheLoader::new(cache_dir, image_h.get(), image_w.get(), None)?;
    ImageDataset::load(image_dir, labels, loader)
}

/// Start the training worker.
///
/// It splits the dataset, trains for the configured epochs and finishes with
/// a validation report on the first training and validation batches.
pub fn training_worker(
    config: Arc<Config>,
    checkpoint_dir: Arc<Path>,
    logging_tx: broadcast::Sender<LoggingMessage>,
) -> Result<()> {
    let Config {
        dataset: ref dataset_config,
        training:
            TrainingConfig {
                batch_size,
                epochs,
                save_checkpoint_epochs,
                ref load_checkpoint,
                device,
                ..
            },
        ref evaluation,
        ..
    } = *config;
    let batch_size = batch_size.get();
    let save_checkpoint_epochs = save_checkpoint_epochs.map(|epochs| epochs.get());

    info!("use device {:?}", device);

    // init model
    info!("initializing model");
    let mut session = TrainingSessionInit::from_config(&config).build()?;
    session.load_checkpoint(&config.logging.dir, load_checkpoint)?;

    // load dataset
    info!("loading dataset");
    let dataset = Arc::new(load_dataset(dataset_config)?);
    let split = random_split(dataset, &dataset_config.split, session.rng())?;
    let train_set = match dataset_config.train_subset {
        Some(limit) => {
            info!("train on the first {} records of the training split", limit);
            split.train.take(limit.get())
        }
        None => split.train,
    };

    // training
    info!("start training");
    while session.epoch() < epochs {
        let lr = session.lr();
        let epoch = session.epoch() + 1;
        let summary = session.train_epoch(&train_set, batch_size, |output| {
            info!(
                "epoch: {}\tstep: {}\tloss: {:.5}\tcls: {:.5}\treg: {:.5}\tpos: {}",
                epoch,
                output.step,
                output.total_loss,
                output.classification_loss,
                output.weighted_regression_loss,
                output.num_positives
            );
            logging_tx
                .send(LoggingMessage::new_training_step(
                    "training-step",
                    TrainingStepLog {
                        step: output.step,
                        lr,
                        total_loss: output.total_loss,
                        classification_loss: output.classification_loss,
                        weighted_regression_loss: output.weighted_regression_loss,
                        recall: output.recall.mean_recall(),
                    },
                ))
                .map_err(|_err| format_err!("cannot send message to logger"))?;
            Ok(())
        })?;

        log_epoch_summary(&summary);
        if summary.num_skipped_batches > 0 {
            warn!(
                "{} batches had a non-finite loss in epoch {}",
                summary.num_skipped_batches, summary.epoch
            );
        }

        // save checkpoint
        if let Some(0) = save_checkpoint_epochs.map(|epochs| summary.epoch % epochs) {
            session.save_checkpoint(&checkpoint_dir, summary.mean_loss)?;
        }

        logging_tx
            .send(LoggingMessage::new_epoch("epoch", summary.clone()))
            .map_err(|_err| format_err!("cannot send message to logger"))?;
    }

    // validation
    let num_images = evaluation.num_images;
    let subsets = [("train", &train_set), ("validation", &split.val)];
    for (name, subset) in subsets {
        let report = match validation_report(&mut session, subset, batch_size, num_images)? {
            Some(report) => report,
            None => {
                warn!("the {} split is empty, skip validation", name);
                continue;
            }
        };
        report.log(name);
        logging_tx
            .send(LoggingMessage::new_validation(
                format!("validation/{}", name),
                session.epoch(),
                report,
            ))
            .map_err(|_err| format_err!("cannot send message to logger"))?;
    }

    info!("training finished after {} epochs", session.epoch());
    Ok(())
}

/// Evaluates the first batch of a dataset. Returns `None` if it is empty.
fn validation_report<D>(
    session: &mut TrainingSession,
    dataset: &D,
    batch_size: usize,
    num_images: usize,
) -> Result<Option<ValidationReport>>
where
    D: RandomAccessDataset + ?Sized,
{
    let first_batch = batch_indexes::<StdRng>(dataset.num_records(), batch_size, None)
        .into_iter()
        .next();
    let indexes = match first_batch {
        Some(indexes) => indexes,
        None => return Ok(None),
    };
    let batch = load_batch(dataset, &indexes)?;
    let report = evaluate::validate(session, batch, num_images)?;
    Ok(Some(report))
}

fn log_epoch_summary(summary: &EpochSummary) {
    let EpochSummary {
        epoch,
        num_samples,
        mean_loss,
        mean_classification_loss,
        mean_regression_loss,
        mean_recall,
        ..
    } = *summary;

    match (mean_recall, summary.error()) {
        (Some(recall), Some(error)) => info!(
            "epoch {} done: {} samples\tloss: {:.5}\tcls: {:.5}\treg: {:.5}\trecall: {:.4}\terror: {:.4}",
            epoch,
            num_samples,
            mean_loss,
            mean_classification_loss,
            mean_regression_loss,
            recall,
            error
        ),
        _ => info!(
            "epoch {} done: {} samples\tloss: {:.5}\tcls: {:.5}\treg: {:.5}",
            epoch, num_samples, mean_loss, mean_classification_loss, mean_regression_loss
        ),
    }
}
