use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::agent::registry::TaskRegistry;
use crate::commands::executor::{CommandExecutor, HandlerOutput};
use crate::commands::result::{CommandParams, CommandResult};
use crate::commands::validator::{require_params, validate_image_info};
use crate::error::AgentError;
use crate::tasks::{ChildFailurePolicy, MultiTask, Task, TaskState, TaskWork};

pub const CACHE_IMAGES: &str = "standby.cache_images";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub urls: Vec<String>,
    pub hashes: Map<String, Value>,
}

/// Puts an image into the node's local cache.
///
/// Called on a dedicated thread per image; may block. Report progress in
/// percent through `progress`.
pub trait ImageCache: Send + Sync {
    fn cache_image(&self, image: &ImageInfo, progress: &dyn Fn(f64)) -> anyhow::Result<()>;
}

/// Keeps a list of the images it was asked to cache without fetching them.
#[derive(Debug, Default)]
pub struct InMemoryImageCache {
    cached: Mutex<Vec<String>>,
}

impl InMemoryImageCache {
    pub fn cached(&self) -> Vec<String> {
        self.cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ImageCache for InMemoryImageCache {
    fn cache_image(&self, image: &ImageInfo, progress: &dyn Fn(f64)) -> anyhow::Result<()> {
        if image.urls.is_empty() {
            return Err(anyhow!("image {} has no urls", image.id));
        }
        self.cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(image.id.clone());
        progress(100.0);
        Ok(())
    }
}

struct CacheImage {
    cache: Arc<dyn ImageCache>,
    image: ImageInfo,
}

impl TaskWork for CacheImage {
    fn start(&self, task: Arc<Task>) {
        let cache = Arc::clone(&self.cache);
        let image = self.image.clone();
        let worker = Arc::clone(&task);
        let spawned = std::thread::Builder::new()
            .name(format!("cache-image-{}", image.id))
            .spawn(move || {
                debug!(image_id = %image.id, urls = image.urls.len(), "caching image");
                let report = |percent: f64| worker.set_percent(percent);
                match cache.cache_image(&image, &report) {
                    Ok(()) => {
                        worker.set_percent(100.0);
                        worker.complete();
                    }
                    Err(e) => {
                        warn!(image_id = %image.id, error = %e, "caching image failed");
                        worker.error(format!("{e:#}"));
                    }
                }
            });
        if let Err(e) = spawned {
            task.error(format!("could not start image worker: {e}"));
        }
    }
}

/// The command set of an agent in `STANDBY` mode.
pub struct StandbyCommands {
    cache: Arc<dyn ImageCache>,
    registry: Arc<TaskRegistry>,
    runtime: Handle,
    reporting_interval: Duration,
}

impl StandbyCommands {
    pub fn new(
        cache: Arc<dyn ImageCache>,
        registry: Arc<TaskRegistry>,
        runtime: Handle,
        reporting_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            registry,
            runtime,
            reporting_interval,
        })
    }

    pub fn register(self: &Arc<Self>, executor: CommandExecutor) -> CommandExecutor {
        let commands = Arc::clone(self);
        executor.with_handler(CACHE_IMAGES, move |name, params| commands.cache_images(name, params))
    }

    /// Validate `image_infos` and cache every image in the background, one
    /// child task per image.
    pub fn cache_images(&self, name: &str, params: &CommandParams) -> anyhow::Result<HandlerOutput> {
        require_params(name, params, &["image_infos"])?;
        let Some(infos) = params["image_infos"].as_array() else {
            return Err(AgentError::InvalidParams(
                "'image_infos' parameter must be a list.".to_string(),
            )
            .into());
        };
        for info in infos {
            validate_image_info(info)?;
        }
        let images = infos
            .iter()
            .map(|info| serde_json::from_value::<ImageInfo>(info.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AgentError::InvalidParams(format!("invalid image info: {e}")))?;

        let result = CommandResult::pending(name, params.clone());
        let aggregate = MultiTask::new(
            &self.registry,
            &format!("cache-images-{}", result.id()),
            CACHE_IMAGES,
            self.reporting_interval,
            ChildFailurePolicy::Propagate,
        );
        let ids: Vec<String> = images.iter().map(|image| image.id.clone()).collect();
        for image in images {
            let id = image.id.clone();
            aggregate.add_task(
                &id,
                "cache_image",
                CacheImage {
                    cache: Arc::clone(&self.cache),
                    image,
                },
            );
        }

        info!(command_id = %result.id(), images = ids.len(), "caching images");
        let runtime = self.runtime.clone();
        let started = result.start(move || {
            let _runtime = runtime.enter();
            aggregate.run();
            let report = aggregate.wait();
            match report.state {
                TaskState::Complete => Ok(json!({ "cached_images": ids })),
                _ => Err(AgentError::CommandExecution(
                    report
                        .error_message
                        .unwrap_or_else(|| "image caching failed".to_string()),
                )
                .into()),
            }
        });
        Ok(started.into())
    }
}
