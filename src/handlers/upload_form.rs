//! Buffered view of a `multipart/form-data` body: text fields by name plus
//! one binary part.

use crate::errors::{AppError, ServiceError};
use axum::extract::Multipart;
use bytes::Bytes;
use std::collections::HashMap;

pub(crate) struct UploadForm {
    fields: HashMap<String, String>,
    file: Option<Bytes>,
    file_name: Option<String>,
}

impl UploadForm {
    /// Read every part. The part named `file_field` is kept as bytes; all
    /// others are read as text.
    pub(crate) async fn read(mut multipart: Multipart, file_field: &str) -> Result<Self, AppError> {
        let mut fields = HashMap::new();
        let mut file = None;
        let mut file_name = None;

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| AppError::new(err.status(), err.body_text()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == file_field {
                file_name = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::new(err.status(), err.body_text()))?;
                file = Some(bytes);
            } else {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::new(err.status(), err.body_text()))?;
                fields.insert(name, value);
            }
        }

        Ok(Self {
            fields,
            file,
            file_name,
        })
    }

    pub(crate) fn optional(&self, name: &str) -> Option<String> {
        self.fields.get(name).cloned()
    }

    pub(crate) fn text(&self, name: &'static str) -> Result<String, AppError> {
        self.optional(name)
            .ok_or_else(|| ServiceError::invalid(name, "is required.").into())
    }

    pub(crate) fn integer(&self, name: &'static str) -> Result<i64, AppError> {
        self.text(name)?
            .trim()
            .parse()
            .map_err(|_| ServiceError::invalid(name, "must be an integer.").into())
    }

    /// The binary part, if one was sent.
    pub(crate) fn take_file(&mut self) -> Option<Bytes> {
        self.file.take()
    }

    /// Client-side file name of the binary part.
    pub(crate) fn take_file_name(&mut self) -> Option<String> {
        self.file_name.take()
    }
}
