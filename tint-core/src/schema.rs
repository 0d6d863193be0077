//! Job input schema and validation.

use serde_json::{Map, Value};

use crate::TintError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Float,
    Int,
    Bool,
}

impl FieldKind {
    fn name(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Float => "float",
            FieldKind::Int => "int",
            FieldKind::Bool => "bool",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            // Integers widen to floats, the other way round is a mismatch.
            FieldKind::Float => value.is_number(),
            FieldKind::Int => value.is_i64() || value.is_u64(),
            FieldKind::Bool => value.is_boolean(),
        }
    }
}

/// Default of an optional field, kept const-constructible so schemas can live
/// in statics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldDefault {
    Null,
    Float(f64),
    Int(i64),
    Str(&'static str),
}

impl FieldDefault {
    fn to_value(self) -> Value {
        match self {
            FieldDefault::Null => Value::Null,
            FieldDefault::Float(v) => Value::from(v),
            FieldDefault::Int(v) => Value::from(v),
            FieldDefault::Str(v) => Value::from(v),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub default: FieldDefault,
    /// Inclusive bounds for numeric fields.
    pub range: Option<(f64, f64)>,
    pub description: &'static str,
}

pub type Schema = [FieldSpec];

pub const IMAGE_GENERATION_SCHEMA: &Schema = &[
    FieldSpec {
        name: "image",
        kind: FieldKind::String,
        required: true,
        default: FieldDefault::Null,
        range: None,
        description: "URL or base64 encoded image",
    },
    FieldSpec {
        name: "prompt",
        kind: FieldKind::String,
        required: true,
        default: FieldDefault::Null,
        range: None,
        description: "Text prompt for image generation",
    },
    FieldSpec {
        name: "negative_prompt",
        kind: FieldKind::String,
        required: false,
        default: FieldDefault::Null,
        range: None,
        description: "Negative text prompt",
    },
    FieldSpec {
        name: "guidance_scale",
        kind: FieldKind::Float,
        required: false,
        default: FieldDefault::Float(7.5),
        range: Some((1.0, 20.0)),
        description: "Guidance scale (1-20)",
    },
    FieldSpec {
        name: "strength",
        kind: FieldKind::Float,
        required: false,
        default: FieldDefault::Float(0.75),
        range: Some((0.0, 1.0)),
        description: "Transformation strength (0-1)",
    },
    FieldSpec {
        name: "num_inference_steps",
        kind: FieldKind::Int,
        required: false,
        default: FieldDefault::Int(50),
        range: Some((1.0, 500.0)),
        description: "Number of denoising steps",
    },
    FieldSpec {
        name: "seed",
        kind: FieldKind::Int,
        required: false,
        default: FieldDefault::Null,
        range: None,
        description: "Random seed, random when omitted",
    },
    FieldSpec {
        name: "model_id",
        kind: FieldKind::String,
        required: false,
        default: FieldDefault::Null,
        range: None,
        description: "Hub repository id, civitai:<version>[/<file>] or local path",
    },
];

/// Validate `raw` against `schema`.
///
/// Returns the validated mapping with defaults filled in, or every problem
/// found. Fields not in the schema are dropped.
pub fn validate(raw: &Value, schema: &Schema) -> Result<Map<String, Value>, Vec<String>> {
    let Some(raw) = raw.as_object() else {
        return Err(vec!["job input must be a JSON object".to_string()]);
    };

    let mut validated = Map::new();
    let mut errors = Vec::new();

    for field in schema {
        let value = match raw.get(field.name) {
            None | Some(Value::Null) if field.required => {
                errors.push(format!("{} is a required input.", field.name));
                continue;
            }
            None | Some(Value::Null) => {
                validated.insert(field.name.to_string(), field.default.to_value());
                continue;
            }
            Some(value) => value,
        };

        if !field.kind.accepts(value) {
            errors.push(format!(
                "{} should be {}, got {}.",
                field.name,
                field.kind.name(),
                json_type_name(value)
            ));
            continue;
        }

        if let (Some((min, max)), Some(number)) = (field.range, value.as_f64()) {
            if number < min || number > max {
                errors.push(format!(
                    "{} must be between {} and {}, got {}.",
                    field.name, min, max, number
                ));
                continue;
            }
        }

        validated.insert(field.name.to_string(), value.clone());
    }

    if errors.is_empty() {
        Ok(validated)
    } else {
        Err(errors)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Where the source image comes from, decided once at validation time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageInput {
    Url(String),
    Base64(String),
}

impl ImageInput {
    pub fn classify(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            ImageInput::Url(trimmed.to_string())
        } else {
            ImageInput::Base64(raw.to_string())
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobInput {
    pub image: ImageInput,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub guidance_scale: f64,
    pub strength: f64,
    pub num_inference_steps: usize,
    pub seed: Option<u64>,
    pub model_id: Option<String>,
}

impl JobInput {
    /// Validate a raw job input against [`IMAGE_GENERATION_SCHEMA`].
    pub fn parse(raw: &Value) -> Result<Self, TintError> {
        let validated = validate(raw, IMAGE_GENERATION_SCHEMA).map_err(TintError::Validation)?;
        Self::from_validated(&validated)
    }

    fn from_validated(map: &Map<String, Value>) -> Result<Self, TintError> {
        let string = |name: &str| map.get(name).and_then(Value::as_str).map(str::to_string);
        let float = |name: &str| map.get(name).and_then(Value::as_f64);

        let image = string("image")
            .ok_or_else(|| TintError::Validation(vec!["image is a required input.".into()]))?;
        let prompt = string("prompt")
            .ok_or_else(|| TintError::Validation(vec!["prompt is a required input.".into()]))?;
        let seed = match map.get("seed") {
            Some(Value::Null) | None => None,
            Some(value) => Some(value.as_u64().ok_or_else(|| {
                TintError::Validation(vec!["seed must be a non-negative integer.".into()])
            })?),
        };

        Ok(JobInput {
            image: ImageInput::classify(&image),
            prompt,
            negative_prompt: string("negative_prompt"),
            guidance_scale: float("guidance_scale").unwrap_or(7.5),
            strength: float("strength").unwrap_or(0.75),
            num_inference_steps: map
                .get("num_inference_steps")
                .and_then(Value::as_u64)
                .unwrap_or(50) as usize,
            seed,
            model_id: string("model_id").filter(|id| !id.trim().is_empty()),
        })
    }
}
