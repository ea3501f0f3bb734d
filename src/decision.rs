//! Post-processing of engine output into user-facing results.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Classifier labels, index-aligned with the model's score vector
pub const CLASS_LABELS: [&str; 11] = [
    "Bread",
    "Dairy product",
    "Dessert",
    "Egg",
    "Fried food",
    "Meat",
    "Noodles/Pasta",
    "Rice",
    "Seafood",
    "Soup",
    "Vegetable/Fruit",
];

/// Reported when no score reaches the threshold
pub const UNRECOGNIZED_LABEL: &str = "unrecognized";

/// Minimum raw score (engine units, not a probability)
pub const CLASSIFICATION_THRESHOLD: f32 = 4.5;

/// Minimum score for an OCR text span to be kept
pub const OCR_SCORE_CUTOFF: f64 = 0.85;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationDecision {
    pub label: String,
    /// Index of the winning label; `None` when unrecognized
    #[serde(skip)]
    pub index: Option<usize>,
    #[serde(skip)]
    pub max_score: Option<f32>,
}

impl ClassificationDecision {
    pub fn is_recognized(&self) -> bool {
        self.index.is_some()
    }
}

/// Single pass over `scores`: the first maximum wins, but only if some score
/// reaches `threshold`.
pub fn classify(scores: &[f32], labels: &[&str], threshold: f32) -> ClassificationDecision {
    let mut any_confident = false;
    let mut best: Option<(usize, f32)> = None;

    for (i, &score) in scores.iter().enumerate() {
        if score >= threshold {
            any_confident = true;
        }
        // Strictly greater, so NaN never becomes the maximum
        let better = match best {
            None => !score.is_nan(),
            Some((_, max)) => score > max,
        };
        if better {
            best = Some((i, score));
        }
    }

    match best {
        Some((index, max_score)) if any_confident && index < labels.len() => {
            ClassificationDecision {
                label: labels[index].to_string(),
                index: Some(index),
                max_score: Some(max_score),
            }
        }
        _ => ClassificationDecision {
            label: UNRECOGNIZED_LABEL.to_string(),
            index: None,
            max_score: best.map(|(_, s)| s),
        },
    }
}

/// Parsed `<name>_res.json`. Entries of the wrong JSON type are kept as `None`
/// so indices stay aligned; fields that are missing or not arrays are empty.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RecognitionResult {
    #[serde(default, deserialize_with = "lenient_texts")]
    pub rec_texts: Vec<Option<String>>,
    #[serde(default, deserialize_with = "lenient_scores")]
    pub rec_scores: Vec<Option<f64>>,
}

fn lenient_texts<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Option<String>>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Array(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

fn lenient_scores<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Option<f64>>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Array(items) => items.iter().map(Value::as_f64).collect(),
        _ => Vec::new(),
    })
}

fn json_kind(value: &Value) -> serde::de::Unexpected<'_> {
    use serde::de::Unexpected;
    match value {
        Value::Null => Unexpected::Unit,
        Value::Bool(b) => Unexpected::Bool(*b),
        Value::Number(_) => Unexpected::Other("number"),
        Value::String(s) => Unexpected::Str(s),
        Value::Array(_) => Unexpected::Seq,
        Value::Object(_) => Unexpected::Map,
    }
}

impl RecognitionResult {
    /// The document must be a JSON object; arrays and scalars are rejected
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(map) => serde_json::from_value(Value::Object(map)),
            other => Err(serde::de::Error::invalid_type(
                json_kind(&other),
                &"a JSON object",
            )),
        }
    }

    /// Texts whose paired score is at least `cutoff`, in original order.
    /// An index present in only one of the two lists ends the valid data.
    pub fn filtered_texts(&self, cutoff: f64) -> Vec<String> {
        self.rec_scores
            .iter()
            .zip(&self.rec_texts)
            .filter_map(|(score, text)| match (score, text) {
                (Some(score), Some(text)) if *score >= cutoff => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}
