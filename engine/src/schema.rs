//! Per-module payload schemas.
//!
//! Schemas name the fields a module relies on. Fields not listed are allowed
//! and stored untouched, so the UI can attach arbitrary extra data.

use crate::{error::Result, Error, Fields, Module};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldDef {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Schema for one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSchema {
    pub module: Module,
    pub fields: Vec<FieldDef>,
}

impl ModuleSchema {
    pub fn new(module: Module, fields: Vec<FieldDef>) -> Self {
        Self { module, fields }
    }

    /// Validate a complete set of fields, as for a create.
    pub fn validate_fields(&self, fields: &Fields) -> Result<()> {
        for def in &self.fields {
            def.validate(fields.get(&def.name))?;
        }
        Ok(())
    }

    /// Validate a partial update: only the fields present are checked, and a
    /// required field may not be cleared with `null`.
    pub fn validate_patch(&self, patch: &Fields) -> Result<()> {
        for def in &self.fields {
            if let Some(value) = patch.get(&def.name) {
                def.validate(Some(value))?;
            }
        }
        Ok(())
    }
}

/// Schemas for every module the store accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub modules: HashMap<Module, ModuleSchema>,
}

impl Default for Schema {
    fn default() -> Self {
        Self::dashboard()
    }
}

impl Schema {
    /// A schema with no field rules; every module accepts any object.
    pub fn permissive() -> Self {
        let modules = Module::ALL
            .into_iter()
            .map(|m| (m, ModuleSchema::new(m, Vec::new())))
            .collect();
        Self { modules }
    }

    /// The field rules of the enterprise dashboard.
    pub fn dashboard() -> Self {
        use FieldType::*;

        Self::permissive()
            .with_module(ModuleSchema::new(
                Module::Customers,
                vec![
                    FieldDef::required("name", String),
                    FieldDef::optional("email", String),
                    FieldDef::optional("company", String),
                    FieldDef::optional("status", String),
                    FieldDef::optional("value", Float),
                ],
            ))
            .with_module(ModuleSchema::new(
                Module::Tasks,
                vec![
                    FieldDef::required("title", String),
                    FieldDef::optional("status", String),
                    FieldDef::optional("priority", String),
                    FieldDef::optional("assignee", String),
                    FieldDef::optional("dueDate", Timestamp),
                    FieldDef::optional("completed", Bool),
                ],
            ))
            .with_module(ModuleSchema::new(
                Module::Okrs,
                vec![
                    FieldDef::required("objective", String),
                    FieldDef::optional("owner", String),
                    FieldDef::optional("progress", Float),
                    FieldDef::optional("keyResults", Json),
                ],
            ))
            .with_module(ModuleSchema::new(
                Module::Invoices,
                vec![
                    FieldDef::required("number", String),
                    FieldDef::required("amount", Float),
                    FieldDef::optional("currency", String),
                    FieldDef::optional("status", String),
                    FieldDef::optional("customerId", String),
                    FieldDef::optional("dueDate", Timestamp),
                ],
            ))
            .with_module(ModuleSchema::new(
                Module::Users,
                vec![
                    FieldDef::required("name", String),
                    FieldDef::required("email", String),
                    FieldDef::optional("role", String),
                    FieldDef::optional("active", Bool),
                ],
            ))
            .with_module(ModuleSchema::new(
                Module::Notifications,
                vec![
                    FieldDef::required("title", String),
                    FieldDef::optional("message", String),
                    FieldDef::optional("severity", String),
                    FieldDef::optional("read", Bool),
                ],
            ))
    }

    /// Builder-style method to replace a module's schema.
    pub fn with_module(mut self, schema: ModuleSchema) -> Self {
        self.modules.insert(schema.module, schema);
        self
    }

    pub fn get(&self, module: Module) -> Option<&ModuleSchema> {
        self.modules.get(&module)
    }

    pub fn validate_fields(&self, module: Module, fields: &Fields) -> Result<()> {
        match self.modules.get(&module) {
            Some(schema) => schema.validate_fields(fields),
            None => Ok(()),
        }
    }

    pub fn validate_patch(&self, module: Module, patch: &Fields) -> Result<()> {
        match self.modules.get(&module) {
            Some(schema) => schema.validate_patch(patch),
            None => Ok(()),
        }
    }
}
