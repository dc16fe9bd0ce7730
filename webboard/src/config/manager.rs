use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use webboard_core::{
    context::ContextId,
    element::ElementId,
    server::{Batch, BatchReport, Change, WebServer},
    AnyResult,
};

use crate::config::{Config, Declared};

/// Keeps the server in line with a config file.
///
/// Every reload turns the difference between the online and the new declarations into a single
/// batch. A rejected batch leaves the previous declarations online.
pub struct StaticFileConfigManager {
    server: Arc<WebServer>,
    online_config_content: Vec<u8>,
    online: Declared,
    // element key -> id of the element currently submitted for it
    online_elements: BTreeMap<String, ElementId>,
}

impl StaticFileConfigManager {
    pub fn new(server: Arc<WebServer>) -> Self {
        Self {
            server,
            online_config_content: Vec::new(),
            online: Declared::default(),
            online_elements: BTreeMap::new(),
        }
    }

    pub async fn load_and_watch(
        mut self,
        path: impl AsRef<Path>,
        interval: Duration,
    ) -> AnyResult<()> {
        self.reload_file(&path)?;
        self.watch(path.as_ref().to_path_buf(), interval).await;
        Ok(())
    }

    /// Returns whether the file changed since the last successful reload.
    pub fn reload_file(&mut self, path: impl AsRef<Path>) -> AnyResult<bool> {
        let latest_content = webboard_core::util::file_read_sync(path)?;
        if self.online_config_content == latest_content {
            return Ok(false);
        }

        tracing::info!("config change detected, reloading");
        let config = Config::parse(&latest_content)?;
        if config.server != *self.server.config() {
            tracing::warn!("server settings changed, they only apply after a restart");
        }
        self.apply(config.declared()?)?;
        tracing::info!("config reload success");
        self.online_config_content = latest_content;
        Ok(true)
    }

    /// Submits what it takes to go from the online declarations to `declared`.
    pub fn apply(&mut self, declared: Declared) -> AnyResult<Option<BatchReport>> {
        let (batch, added) = self.diff(&declared)?;
        if batch.is_empty() {
            self.online = declared;
            return Ok(None);
        }
        let report = self.server.submit(batch)?;
        self.online_elements
            .retain(|key, _| declared.elements.get(key) == self.online.elements.get(key));
        self.online_elements.extend(added);
        self.online = declared;
        Ok(Some(report))
    }

    fn diff(&self, new: &Declared) -> AnyResult<(Batch, Vec<(String, ElementId)>)> {
        let mut batch = self.server.begin_batch("config reload");
        let old = &self.online;

        // removals first
        for (key, id) in &self.online_elements {
            if new.elements.get(key) != old.elements.get(key) {
                batch.add(Change::RemoveElement(*id));
            }
        }
        for (name, context) in &old.contexts {
            match new.contexts.get(name) {
                Some(updated) if updated == context => {}
                Some(updated) if context.same_but_rank(updated) => {
                    batch.add(Change::UpdateContextRank {
                        context: ContextId::new(name),
                        rank: updated.rank,
                    });
                }
                _ => {
                    batch.add(Change::RemoveLogicalContext(ContextId::new(name)));
                }
            }
        }

        for (name, context) in &new.contexts {
            let re_add = match old.contexts.get(name) {
                None => true,
                Some(previous) => !previous.same_but_rank(context),
            };
            if re_add {
                batch.add(Change::AddLogicalContext(context.build()?));
            }
        }
        let mut added = Vec::new();
        for (key, element) in &new.elements {
            if old.elements.get(key) == Some(element) {
                continue;
            }
            let model = element.build(self.server.next_service_id())?;
            added.push((key.clone(), model.id()));
            batch.add(Change::add_element(model));
        }
        Ok((batch, added))
    }

    async fn watch(mut self, path: PathBuf, interval: Duration) {
        loop {
            monoio::time::sleep(interval).await;
            if let Err(e) = self.reload_file(&path) {
                tracing::error!("reload config failed: {e}");
            }
        }
    }
}
