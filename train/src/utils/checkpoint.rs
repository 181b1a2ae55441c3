use crate::{common::*, config::LoadCheckpoint};
use regex::Regex;

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

const CHECKPOINT_FILENAME_PATTERN: &str =
    r"^(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}\.\d{3}[+-]\d{4})_(\d{4,})_([^_]+)\.ckpt$";

/// The name of a checkpoint file saved at the end of `epoch`.
pub fn checkpoint_filename(time: &DateTime<Local>, epoch: usize, loss: f64) -> String {
    format!(
        "{}_{:04}_{:08.5}.ckpt",
        time.format(FILE_STRFTIME),
        epoch,
        loss
    )
}

/// Save parameters to a checkpoint file.
pub fn save_checkpoint(
    vs: &nn::VarStore,
    checkpoint_dir: &Path,
    epoch: usize,
    loss: f64,
) -> Result<PathBuf> {
    let filename = checkpoint_filename(&Local::now(), epoch, loss);
    let path = checkpoint_dir.join(filename);
    vs.save(&path)
        .with_context(|| format!("failed to save checkpoint '{}'", path.display()))?;
    info!("saved checkpoint '{}'", path.display());
    Ok(path)
}

/// Parses the creation time and the epoch from a checkpoint file name.
pub fn parse_checkpoint_filename(file_name: &str) -> Option<(DateTime<FixedOffset>, usize)> {
    let regex = Regex::new(CHECKPOINT_FILENAME_PATTERN).ok()?;
    let captures = regex.captures(file_name)?;
    let datetime = DateTime::parse_from_str(captures.get(1)?.as_str(), FILE_STRFTIME).ok()?;
    let epoch = captures.get(2)?.as_str().parse().ok()?;
    Some((datetime, epoch))
}

/// Finds the newest checkpoint file under the `*/checkpoints` directories of
/// the logging directory.
pub fn find_recent_checkpoint(logging_dir: &Path) -> Result<Option<PathBuf>> {
    let pattern = format!("{}/*/checkpoints/*.ckpt", logging_dir.display());
    let paths = glob::glob(&pattern)?.collect::<Result<Vec<_>, _>>()?;
    let recent = paths
        .into_iter()
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?;
            let (datetime, _epoch) = parse_checkpoint_filename(file_name)?;
            Some((path, datetime))
        })
        .max_by_key(|(_path, datetime)| *datetime)
        .map(|(path, _datetime)| path);
    Ok(recent)
}

/// Load parameters from a diretory with specified checkpoint loading method.
///
/// Returns the path of the loaded file if any.
pub fn try_load_checkpoint(
    vs: &mut nn::VarStore,
    logging_dir: &Path,
    load_checkpoint: &LoadCheckpoint,
) -> Result<Option<PathBuf>> {
    let path = match load_checkpoint {
        LoadCheckpoint::Disabled => {
            info!("checkpoint loading is disabled");
            None
        }
        LoadCheckpoint::FromRecent => {
            let checkpoint_file = find_recent_checkpoint(logging_dir)?;
            if checkpoint_file.is_none() {
                warn!("no checkpoint file found");
            }
            checkpoint_file
        }
        LoadCheckpoint::FromFile { file } => {
            if file.is_file() {
                Some(file.to_owned())
            } else {
                warn!("{} is not a file", file.display());
                None
            }
        }
    };

    if let Some(path) = &path {
        info!("load checkpoint file {}", path.display());
        let missing = vs
            .load_partial(path)
            .with_context(|| format!("failed to load checkpoint '{}'", path.display()))?;
        if !missing.is_empty() {
            warn!("variables missing in checkpoint: {}", missing.join(", "));
        }
    }

    Ok(path)
}
