pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use bbox::{prelude::*, TLBRTensor, TLBR};
pub use itertools::{izip, Itertools as _};
pub use log::{debug, info, warn};
pub use noisy_float::prelude::*;
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    collections::HashMap,
    fmt::Debug,
    fs,
    hash::Hash,
    mem,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};
pub use tch::{
    kind::{FLOAT_CPU, INT64_CPU},
    nn::{self, ModuleT as _},
    Device, IndexOp, Kind, Reduction, Tensor,
};
