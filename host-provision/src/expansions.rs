// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `${name}` placeholder expansion for distro scripts.
//!
//! `${name}` is replaced with the named value and `${name|fallback}` falls
//! back to the literal text after the bar when `name` is undefined.  Any
//! other `$` is left alone, so shell variables such as `$PATH` pass through.

use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExpansionError {
    #[error("no value for expansion {name:?}")]
    Undefined { name: String },
    #[error("unterminated expansion starting at byte {offset}")]
    Unterminated { offset: usize },
}

#[derive(Clone, Debug, Default)]
pub struct Expansions {
    values: BTreeMap<String, String>,
}

impl Expansions {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn expand(&self, input: &str) -> Result<String, ExpansionError> {
        let mut output = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("${") {
            output.push_str(&rest[..start]);
            let body = &rest[start + 2..];
            let end = body.find('}').ok_or_else(|| {
                ExpansionError::Unterminated {
                    offset: input.len() - rest.len() + start,
                }
            })?;
            output.push_str(&self.resolve(&body[..end])?);
            rest = &body[end + 1..];
        }
        output.push_str(rest);
        Ok(output)
    }

    fn resolve(&self, placeholder: &str) -> Result<String, ExpansionError> {
        let (name, fallback) = match placeholder.split_once('|') {
            Some((name, fallback)) => (name.trim(), Some(fallback)),
            None => (placeholder.trim(), None),
        };
        match (self.values.get(name), fallback) {
            (Some(value), _) => Ok(value.clone()),
            (None, Some(fallback)) => Ok(fallback.to_string()),
            (None, None) => {
                Err(ExpansionError::Undefined { name: name.to_string() })
            }
        }
    }
}
