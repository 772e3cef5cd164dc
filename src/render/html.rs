//! Render target that writes a standalone HTML page.

use std::{io::ErrorKind, path::PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use super::{RenderError, RenderTarget};
use crate::{execution::PlotArtifact, loader::Resource};

pub struct HtmlFileTarget {
    path: PathBuf,
    id: String,
    entry_point: String,
}

impl HtmlFileTarget {
    pub fn new(path: PathBuf, id: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self { path, id: id.into(), entry_point: entry_point.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn page(&self, resource: &Resource, item: &str) -> String {
        format!(
            "<!DOCTYPE html>\n<html lang=\"ja\">\n<head>\n<meta charset=\"utf-8\">\n\
             <title>hibiki plot</title>\n<script>\n{source}\n</script>\n</head>\n<body>\n\
             <div id=\"{id}\"></div>\n<script>\n{entry}.embed.embed_item({item}, \"{id}\");\n</script>\n\
             </body>\n</html>\n",
            source = script_safe(&resource.source),
            id = self.id,
            entry = self.entry_point,
            item = item,
        )
    }
}

// `</` inside an inline script would close the tag early.
fn script_safe(text: &str) -> String {
    text.replace("</", "<\\/")
}

#[async_trait]
impl RenderTarget for HtmlFileTarget {
    fn id(&self) -> &str {
        &self.id
    }

    fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(target: "hibiki", path = %self.path.display(), error = %e, "could not clear plot"),
        }
    }

    async fn embed(&self, resource: &Resource, artifact: &PlotArtifact) -> Result<(), RenderError> {
        let fail = |message: String| RenderError::Embed { target: self.id.clone(), message };
        let item = serde_json::to_string(artifact).map_err(|e| fail(e.to_string()))?;
        let page = self.page(resource, &script_safe(&item));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| fail(e.to_string()))?;
        }
        tokio::fs::write(&self.path, page).await.map_err(|e| fail(e.to_string()))?;
        info!(target: "hibiki", path = %self.path.display(), version = %resource.version, "plot written");
        Ok(())
    }
}
