//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use cbam_rpn::{
    anchor::{AnchorConfig, AnchorGenerator, AnchorSet, GridLayout},
    dataset::{
        batch_indexes, load_batch, load_label_file, random_split, Batch, CacheLoader,
        GroundTruth, ImageDataset, LabelIndex, RandomAccessDataset, SplitConfig, Subset,
    },
    loss::{RpnLoss, RpnLossInit, RpnLossOutput},
    metric::{BatchRecall, ImageRecall, ProposalRecall, RecallInit},
    model::{RpnHead, RpnHeadInit, RpnOutput, Vgg16Backbone},
    target::{AssignerConfig, TargetAssigner},
    RpnError,
};
pub use chrono::{DateTime, FixedOffset, Local};
pub use futures::future::{Future, FutureExt};
pub use itertools::Itertools;
pub use log::{debug, info, warn};
pub use noisy_float::prelude::*;
pub use rand::{prelude::*, rngs::StdRng};
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Cow,
    collections::HashMap,
    fmt::Debug,
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};
pub use tch::{
    kind::FLOAT_CPU,
    nn::{self, OptimizerConfig as _},
    Device, Kind, Tensor,
};
pub use tfrecord::{EventAsyncWriter, EventWriterConfig};
pub use tokio::sync::broadcast;

pub type Fallible<T> = Result<T, Error>;
