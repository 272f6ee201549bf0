// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    BadArgument(String),

    #[error("Couldn't read the arguments file: {0}")]
    ArgFile(#[from] toml::de::Error),

    #[error(transparent)]
    Vela(#[from] crate::VelaError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

impl From<crate::controller::ControlError> for CliError {
    fn from(e: crate::controller::ControlError) -> CliError {
        CliError::Vela(e.into())
    }
}

impl From<crate::vis::VisError> for CliError {
    fn from(e: crate::vis::VisError) -> CliError {
        CliError::Vela(e.into())
    }
}
