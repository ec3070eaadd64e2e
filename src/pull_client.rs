/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod ttrpc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use prost::Message;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::net::UnixStream;
use tracing::debug;

static SERVICE: &str = "api.ImagePullService";
static METHOD: &str = "PullImage";

/// Client streams carry odd ids; a fresh connection starts at 1.
const STREAM_ID: u32 = 1;

#[async_trait]
pub trait ImagePuller: Send + Sync {
    /// Pulls `image` and unpacks it into `bundle_path`.
    async fn pull(&self, image: &str, bundle_path: &Path) -> anyhow::Result<()>;
}

/// Issues one unary `PullImage` call per pull over a fresh unix socket connection.
#[derive(Debug, Clone)]
pub struct TtrpcPuller {
    socket_path: PathBuf,
    deadline: Duration,
}
impl TtrpcPuller {
    pub fn new(socket_path: impl Into<PathBuf>, deadline: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            deadline,
        }
    }

    async fn request(&self, image: &str, bundle_path: &Path) -> anyhow::Result<()> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("Failed to dial {}", self.socket_path.display()))?;

        let pull = ttrpc::ImagePullRequest {
            image_url: image.to_string(),
            bundle_path: bundle_path.to_string_lossy().into_owned(),
        };
        let request = ttrpc::Request {
            service: SERVICE.to_string(),
            method: METHOD.to_string(),
            payload: pull.encode_to_vec(),
            timeout_nano: i64::try_from(self.deadline.as_nanos()).unwrap_or(i64::MAX),
        };
        ttrpc::write_frame(
            &mut stream,
            STREAM_ID,
            ttrpc::MESSAGE_TYPE_REQUEST,
            &request.encode_to_vec(),
        )
        .await?;

        let frame = loop {
            let frame = ttrpc::read_frame(&mut stream).await?;
            if frame.header.stream_id == STREAM_ID
                && frame.header.message_type == ttrpc::MESSAGE_TYPE_RESPONSE
            {
                break frame;
            }
            debug!("Ignoring unexpected frame {:?}", frame.header);
        };

        let response = ttrpc::Response::decode(frame.payload.as_slice())
            .context("Failed to decode ttrpc response")?;
        match response.status {
            Some(status) if status.code != 0 => Err(anyhow!(
                "{}.{} failed with code {}: {}",
                SERVICE,
                METHOD,
                status.code,
                status.message
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ImagePuller for TtrpcPuller {
    async fn pull(&self, image: &str, bundle_path: &Path) -> anyhow::Result<()> {
        tokio::time::timeout(self.deadline, self.request(image, bundle_path))
            .await
            .map_err(|_| {
                anyhow!(
                    "Pulling {} exceeded the deadline of {}s",
                    image,
                    self.deadline.as_secs_f64()
                )
            })?
    }
}
