//! Configuration validation for implementation tables.
//!
//! Endpoint and signer implementations receive their settings as raw
//! `toml::Value` tables. Each implementation describes the table it expects
//! with a [`Schema`] and validates it before constructing anything.

use thiserror::Error;

/// Errors that can occur during configuration validation.
#[derive(Debug, Error)]
pub enum ValidationError {
	#[error("Missing required field: {0}")]
	MissingField(String),
	#[error("Invalid value for field '{field}': {message}")]
	InvalidValue { field: String, message: String },
	#[error("Type mismatch for field '{field}': expected {expected}, got {actual}")]
	TypeMismatch {
		field: String,
		expected: String,
		actual: String,
	},
	#[error("Failed to deserialize config: {0}")]
	DeserializationError(String),
}

/// Expected type of a configuration field.
#[derive(Debug)]
pub enum FieldType {
	String,
	/// Integer with optional inclusive bounds.
	Integer {
		min: Option<i64>,
		max: Option<i64>,
	},
	/// Float (integers are accepted) with optional inclusive bounds.
	Float {
		min: Option<f64>,
		max: Option<f64>,
	},
	Boolean,
	Array(Box<FieldType>),
	Table(Schema),
}

/// Custom check run after the type check succeeds.
pub type FieldValidator = Box<dyn Fn(&toml::Value) -> Result<(), String> + Send + Sync>;

/// A named field of a schema.
pub struct Field {
	pub name: String,
	pub field_type: FieldType,
	pub validator: Option<FieldValidator>,
}

impl std::fmt::Debug for Field {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Field")
			.field("name", &self.name)
			.field("field_type", &self.field_type)
			.field("validator", &self.validator.is_some())
			.finish()
	}
}

impl Field {
	pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
		Self {
			name: name.into(),
			field_type,
			validator: None,
		}
	}

	/// Attaches a custom validator returning an error message on failure.
	pub fn with_validator<F>(mut self, validator: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<(), String> + Send + Sync + 'static,
	{
		self.validator = Some(Box::new(validator));
		self
	}

	fn check(&self, value: &toml::Value) -> Result<(), ValidationError> {
		validate_field_type(&self.name, value, &self.field_type)?;
		if let Some(validator) = &self.validator {
			validator(value).map_err(|message| ValidationError::InvalidValue {
				field: self.name.clone(),
				message,
			})?;
		}
		Ok(())
	}
}

/// Required and optional fields of a TOML table.
#[derive(Debug)]
pub struct Schema {
	pub required: Vec<Field>,
	pub optional: Vec<Field>,
}

impl Schema {
	pub fn new(required: Vec<Field>, optional: Vec<Field>) -> Self {
		Self { required, optional }
	}

	/// Validates `config` against this schema.
	///
	/// # Errors
	///
	/// Returns the first missing required field, type mismatch, out of range
	/// value or failing custom validator. Nested table errors carry the dotted
	/// path of the offending field.
	pub fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let table = config
			.as_table()
			.ok_or_else(|| mismatch("root", "table", config))?;

		for field in &self.required {
			let value = table
				.get(&field.name)
				.ok_or_else(|| ValidationError::MissingField(field.name.clone()))?;
			field.check(value)?;
		}

		for field in &self.optional {
			if let Some(value) = table.get(&field.name) {
				field.check(value)?;
			}
		}

		Ok(())
	}
}

fn mismatch(field: &str, expected: &str, value: &toml::Value) -> ValidationError {
	ValidationError::TypeMismatch {
		field: field.to_string(),
		expected: expected.to_string(),
		actual: value.type_str().to_string(),
	}
}

fn out_of_range(field: &str, message: String) -> ValidationError {
	ValidationError::InvalidValue {
		field: field.to_string(),
		message,
	}
}

fn validate_field_type(
	field_name: &str,
	value: &toml::Value,
	expected_type: &FieldType,
) -> Result<(), ValidationError> {
	match expected_type {
		FieldType::String => {
			if !value.is_str() {
				return Err(mismatch(field_name, "string", value));
			}
		},
		FieldType::Integer { min, max } => {
			let int_val = value
				.as_integer()
				.ok_or_else(|| mismatch(field_name, "integer", value))?;
			if let Some(min_val) = min.filter(|m| int_val < *m) {
				return Err(out_of_range(
					field_name,
					format!("Value {} is less than minimum {}", int_val, min_val),
				));
			}
			if let Some(max_val) = max.filter(|m| int_val > *m) {
				return Err(out_of_range(
					field_name,
					format!("Value {} is greater than maximum {}", int_val, max_val),
				));
			}
		},
		FieldType::Float { min, max } => {
			let float_val = value
				.as_float()
				.or_else(|| value.as_integer().map(|i| i as f64))
				.ok_or_else(|| mismatch(field_name, "float", value))?;
			if let Some(min_val) = min.filter(|m| float_val < *m) {
				return Err(out_of_range(
					field_name,
					format!("Value {} is less than minimum {}", float_val, min_val),
				));
			}
			if let Some(max_val) = max.filter(|m| float_val > *m) {
				return Err(out_of_range(
					field_name,
					format!("Value {} is greater than maximum {}", float_val, max_val),
				));
			}
		},
		FieldType::Boolean => {
			if !value.is_bool() {
				return Err(mismatch(field_name, "boolean", value));
			}
		},
		FieldType::Array(inner_type) => {
			let array = value
				.as_array()
				.ok_or_else(|| mismatch(field_name, "array", value))?;
			for (i, item) in array.iter().enumerate() {
				validate_field_type(&format!("{}[{}]", field_name, i), item, inner_type)?;
			}
		},
		FieldType::Table(schema) => {
			schema.validate(value).map_err(|e| match e {
				ValidationError::MissingField(f) => {
					ValidationError::MissingField(format!("{}.{}", field_name, f))
				},
				ValidationError::InvalidValue { field, message } => ValidationError::InvalidValue {
					field: format!("{}.{}", field_name, field),
					message,
				},
				ValidationError::TypeMismatch {
					field,
					expected,
					actual,
				} => ValidationError::TypeMismatch {
					field: format!("{}.{}", field_name, field),
					expected,
					actual,
				},
				other => other,
			})?;
		},
	}

	Ok(())
}

/// A schema that can validate an implementation's TOML table.
pub trait ConfigSchema: Send + Sync {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	fn endpoint_schema() -> Schema {
		Schema::new(
			vec![Field::new("url", FieldType::String).with_validator(|v| {
				match v.as_str() {
					Some(url) if url.starts_with("http") => Ok(()),
					_ => Err("url must start with http".to_string()),
				}
			})],
			vec![
				Field::new(
					"poll_interval_ms",
					FieldType::Integer {
						min: Some(1),
						max: None,
					},
				),
				Field::new(
					"weight",
					FieldType::Float {
						min: Some(0.0),
						max: Some(1.0),
					},
				),
			],
		)
	}

	#[test]
	fn test_valid_table() {
		let config: toml::Value =
			toml::from_str("url = \"http://localhost:8545\"\npoll_interval_ms = 100\nweight = 1")
				.unwrap();
		assert!(endpoint_schema().validate(&config).is_ok());
	}

	#[test]
	fn test_missing_and_invalid_fields() {
		let config: toml::Value = toml::from_str("poll_interval_ms = 100").unwrap();
		assert!(matches!(
			endpoint_schema().validate(&config),
			Err(ValidationError::MissingField(f)) if f == "url"
		));

		let config: toml::Value = toml::from_str("url = \"ws://x\"").unwrap();
		assert!(matches!(
			endpoint_schema().validate(&config),
			Err(ValidationError::InvalidValue { .. })
		));

		let config: toml::Value =
			toml::from_str("url = \"http://x\"\npoll_interval_ms = 0").unwrap();
		assert!(endpoint_schema().validate(&config).is_err());

		let config: toml::Value = toml::from_str("url = \"http://x\"\nweight = 1.5").unwrap();
		assert!(endpoint_schema().validate(&config).is_err());
	}

	#[test]
	fn test_nested_table_error_path() {
		let schema = Schema::new(
			vec![Field::new("inner", FieldType::Table(endpoint_schema()))],
			vec![],
		);
		let config: toml::Value = toml::from_str("[inner]\nurl = 5").unwrap();
		match schema.validate(&config) {
			Err(ValidationError::TypeMismatch { field, .. }) => assert_eq!(field, "inner.url"),
			other => panic!("unexpected result: {:?}", other),
		}
	}
}
