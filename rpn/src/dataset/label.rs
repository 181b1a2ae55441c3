use super::GroundTruth;
use crate::common::*;
use serde::de::{self, IgnoredAny, SeqAccess, Visitor};
use std::{fmt, fs::File, io::BufReader};

/// Annotation of one image in the BDD100K label format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelItem {
    pub name: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub labels: Vec<ObjectLabel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectLabel {
    pub category: String,
    #[serde(default)]
    pub box2d: Option<Box2D>,
}

/// Box corners in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Box2D {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl LabelItem {
    /// Builds the ground truth of the dataset entry at `index` from the
    /// labels having a 2D box.
    pub fn to_ground_truth(&self, index: usize) -> Result<GroundTruth> {
        let objects = self.labels.iter().filter_map(|label| {
            let Box2D { x1, y1, x2, y2 } = label.box2d?;
            Some((label.category.as_str(), [y1, x1, y2, x2]))
        });
        GroundTruth::new(index, objects)
    }
}

/// Label items keyed by the file stem of their image name.
#[derive(Debug, Clone, Default)]
pub struct LabelIndex {
    items: HashMap<String, LabelItem>,
}

impl LabelIndex {
    pub fn new<I>(items: I) -> Self
    where
        I: IntoIterator<Item = LabelItem>,
    {
        let items = items
            .into_iter()
            .map(|item| (standardize_filename(&item.name), item))
            .collect();
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Looks up the label of an image path or name.
    pub fn get(&self, name: impl AsRef<Path>) -> Option<&LabelItem> {
        self.items.get(&standardize_filename(name))
    }
}

/// Returns the file name without directories and extension.
pub fn standardize_filename(name: impl AsRef<Path>) -> String {
    name.as_ref()
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Reads the first `max_items` entries of a BDD100K label file.
///
/// Labels without a 2D box are dropped. Entries after `max_items` are parsed
/// but not kept.
pub fn load_label_file(path: impl AsRef<Path>, max_items: Option<usize>) -> Result<Vec<LabelItem>> {
    let path = path.as_ref();
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open '{}'", path.display()))?,
    );
    let mut deserializer = serde_json::Deserializer::from_reader(reader);
    let mut items = de::Deserializer::deserialize_seq(
        &mut deserializer,
        FirstItems(max_items.unwrap_or(usize::MAX)),
    )
    .with_context(|| format!("failed to parse label file '{}'", path.display()))?;

    items.iter_mut().for_each(|item| {
        item.labels.retain(|label| label.box2d.is_some());
    });

    info!("loaded {} label items from '{}'", items.len(), path.display());
    Ok(items)
}

struct FirstItems(usize);

impl<'de> Visitor<'de> for FirstItems {
    type Value = Vec<LabelItem>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "an array of label items")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = vec![];
        while items.len() < self.0 {
            match seq.next_element()? {
                Some(item) => items.push(item),
                None => return Ok(items),
            }
        }
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpnError;
    use std::io::Write;

    const LABELS: &str = r#"[
        {
            "name": "b1c66a42-6f7d68ca.jpg",
            "timestamp": 10000,
            "labels": [
                {"category": "car", "box2d": {"x1": 10.0, "y1": 20.0, "x2": 110.0, "y2": 70.0}},
                {"category": "lane", "poly2d": []},
                {"category": "person", "box2d": {"x1": 300.5, "y1": 200.0, "x2": 320.0, "y2": 260.0}}
            ]
        },
        {"name": "b1c81faa-3df17267.jpg", "labels": []},
        {"name": "b1ca2e5d-84cf9134.jpg", "timestamp": 10000, "labels": [
            {"category": "bus", "box2d": {"x1": 5.0, "y1": 6.0, "x2": 7.0, "y2": 8.0}}
        ]}
    ]"#;

    fn label_file() -> Result<tempfile::NamedTempFile> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(LABELS.as_bytes())?;
        Ok(file)
    }

    #[test]
    fn load_first_items() -> Result<()> {
        let file = label_file()?;

        let items = load_label_file(file.path(), Some(2))?;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].labels.len(), 2);
        assert_eq!(items[0].timestamp, Some(10000));
        assert_eq!(items[1].timestamp, None);

        let items = load_label_file(file.path(), None)?;
        assert_eq!(items.len(), 3);
        Ok(())
    }

    #[test]
    fn convert_to_ground_truth() -> Result<()> {
        let file = label_file()?;
        let items = load_label_file(file.path(), None)?;

        let gt = items[0].to_ground_truth(4)?;
        assert_eq!(gt.index, 4);
        assert_eq!(gt.names, vec!["car".to_string(), "person".to_string()]);
        assert_eq!(gt.boxes[0].tlbr(), [20.0, 10.0, 70.0, 110.0]);

        assert!(items[1].to_ground_truth(0)?.is_empty());
        Ok(())
    }

    #[test]
    fn reject_malformed_label() {
        let item = LabelItem {
            name: "a.jpg".into(),
            timestamp: None,
            labels: vec![ObjectLabel {
                category: "car".into(),
                box2d: Some(Box2D {
                    x1: 10.0,
                    y1: 50.0,
                    x2: 20.0,
                    y2: 40.0,
                }),
            }],
        };
        let err = item.to_ground_truth(0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RpnError>(),
            Some(RpnError::MalformedBox { .. })
        ));
    }

    #[test]
    fn lookup_by_file_stem() -> Result<()> {
        let file = label_file()?;
        let index = LabelIndex::new(load_label_file(file.path(), None)?);

        assert_eq!(index.len(), 3);
        assert!(index.get("images/b1c66a42-6f7d68ca.png").is_some());
        assert!(index.get("b1ca2e5d-84cf9134").is_some());
        assert!(index.get("missing.jpg").is_none());
        assert_eq!(standardize_filename("/data/train/abc.def.jpg"), "abc.def");
        Ok(())
    }
}
