//! Virtual Node Tree (spec §4.3): a lazily-materialized arena of directory
//! and file nodes, one per distinct rendered path, built by walking a
//! compiled `Template` against entities pulled through the `Crawler`.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};

use crate::crawler::{Crawler, RemoteSource};
use crate::entity::{Entity, File, Level};
use crate::error::{CrawlError, NodeExpansionError};
use crate::template::{Segment, Template};
use crate::token::{self, Bindings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);
}

#[derive(Debug, Clone)]
pub enum MaterializationState {
    Unexpanded,
    Expanding,
    Expanded,
    Failed(NodeExpansionError),
}

#[derive(Debug, Clone)]
pub struct VirtualNode {
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: BTreeMap<String, NodeId>,
    pub bindings: Bindings,
    pub segment_index: usize,
    pub state: MaterializationState,
    pub entity: Option<Entity>,
}

impl VirtualNode {
    fn leaf_file(&self) -> Option<&File> {
        self.bindings.file.as_ref()
    }

    pub fn is_dir(&self) -> bool {
        self.bindings.file.is_none()
    }
}

/// Owns the node arena and the template it was compiled from. Every mutation
/// of the tree happens through `&self` with interior locking so the
/// dispatcher can drive it from many concurrent FUSE callbacks (spec §5
/// describes the single-writer funnel that sits above this in practice; the
/// lock here is the last line of defense for anything that slips through).
pub struct Resolver<S: RemoteSource> {
    template: Template,
    crawler: Arc<Crawler<S>>,
    generic_roots: BTreeSet<String>,
    nodes: Mutex<Vec<VirtualNode>>,
    /// Per-node completion signal for `ensure_expanded`, mirroring
    /// `ContentCache`'s inflight map (spec §4.5): a caller that observes
    /// `MaterializationState::Expanding` subscribes and waits here instead
    /// of re-entering `expand()` concurrently, so at most one remote fetch
    /// happens per node regardless of how many FUSE callbacks race on it.
    expanding: DashMap<usize, broadcast::Sender<Result<(), NodeExpansionError>>>,
}

impl<S: RemoteSource> Resolver<S> {
    pub fn new(template: Template, crawler: Arc<Crawler<S>>, generic_roots: BTreeSet<String>) -> Self {
        let root = VirtualNode {
            name: String::new(),
            parent: None,
            children: BTreeMap::new(),
            bindings: Bindings::default(),
            segment_index: 0,
            state: MaterializationState::Unexpanded,
            entity: None,
        };
        Resolver { template, crawler, generic_roots, nodes: Mutex::new(vec![root]), expanding: DashMap::new() }
    }

    pub async fn node_name(&self, id: NodeId) -> String {
        self.nodes.lock().await[id.0].name.clone()
    }

    pub async fn is_dir(&self, id: NodeId) -> bool {
        self.nodes.lock().await[id.0].is_dir()
    }

    pub async fn file(&self, id: NodeId) -> Option<File> {
        self.nodes.lock().await[id.0].leaf_file().cloned()
    }

    pub async fn entity(&self, id: NodeId) -> Option<Entity> {
        self.nodes.lock().await[id.0].entity.clone()
    }

    pub async fn bindings(&self, id: NodeId) -> Bindings {
        self.nodes.lock().await[id.0].bindings.clone()
    }

    /// Children of `id` in lexicographic name order, expanding the node
    /// first if needed (spec §4.3 "readdir ordering stability" — stable
    /// because `BTreeMap` iterates sorted by key).
    pub async fn readdir(&self, id: NodeId) -> Result<Vec<(String, NodeId)>, NodeExpansionError> {
        self.ensure_expanded(id).await?;
        let nodes = self.nodes.lock().await;
        Ok(nodes[id.0].children.iter().map(|(k, v)| (k.clone(), *v)).collect())
    }

    pub async fn lookup_child(&self, id: NodeId, name: &str) -> Result<Option<NodeId>, NodeExpansionError> {
        self.ensure_expanded(id).await?;
        let nodes = self.nodes.lock().await;
        Ok(nodes[id.0].children.get(name).copied())
    }

    pub async fn node_state(&self, id: NodeId) -> MaterializationState {
        self.nodes.lock().await[id.0].state.clone()
    }

    /// Expands `id` if it hasn't been already. Concurrent callers for the
    /// same node genuinely coalesce: the first caller through the
    /// `Unexpanded -> Expanding` transition owns `expand()` and broadcasts
    /// its result when done; every other caller subscribes to that
    /// broadcast instead of re-running `expand()`, so at most one remote
    /// fetch happens per node regardless of how many FUSE callbacks race
    /// on it.
    async fn ensure_expanded(&self, id: NodeId) -> Result<(), NodeExpansionError> {
        loop {
            {
                let nodes = self.nodes.lock().await;
                match &nodes[id.0].state {
                    MaterializationState::Expanded => return Ok(()),
                    MaterializationState::Failed(e) => return Err(e.clone()),
                    MaterializationState::Expanding | MaterializationState::Unexpanded => {}
                }
            }

            if let Some(sender) = self.expanding.get(&id.0) {
                let mut rx = sender.subscribe();
                drop(sender);
                match rx.recv().await {
                    Ok(result) => return result,
                    Err(broadcast::error::RecvError::Closed) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }

            let (tx, _rx) = broadcast::channel(1);
            {
                let mut nodes = self.nodes.lock().await;
                if !matches!(nodes[id.0].state, MaterializationState::Unexpanded) {
                    // Lost the race: another caller already transitioned
                    // this node. Loop back and subscribe/recheck instead.
                    continue;
                }
                nodes[id.0].state = MaterializationState::Expanding;
                if self.expanding.insert(id.0, tx.clone()).is_some() {
                    continue;
                }
            }

            let result = self.expand(id).await;

            let mut nodes = self.nodes.lock().await;
            match &result {
                Ok(()) => nodes[id.0].state = MaterializationState::Expanded,
                Err(e) => nodes[id.0].state = MaterializationState::Failed(e.clone()),
            }
            drop(nodes);
            self.expanding.remove(&id.0);
            let _ = tx.send(result.clone());
            return result;
        }
    }

    async fn expand(&self, id: NodeId) -> Result<(), NodeExpansionError> {
        let (segment_index, bindings, parent_entity) = {
            let nodes = self.nodes.lock().await;
            let node = &nodes[id.0];
            (node.segment_index, node.bindings.clone(), node.entity.clone())
        };

        if segment_index >= self.template.segments.len() {
            // Leaf already reached; nothing further to materialize.
            return Ok(());
        }
        let segment = &self.template.segments[segment_index];

        let planned = self.plan_children(segment, segment_index, &bindings, parent_entity.as_ref()).await?;
        let planned = disambiguate(planned);

        let mut nodes = self.nodes.lock().await;
        for (name, child_bindings, child_segment_index, child_entity) in planned {
            if nodes[id.0].children.contains_key(&name) {
                continue;
            }
            let child_id = NodeId(nodes.len());
            nodes.push(VirtualNode {
                name: name.clone(),
                parent: Some(id),
                children: BTreeMap::new(),
                bindings: child_bindings,
                segment_index: child_segment_index,
                state: MaterializationState::Unexpanded,
                entity: child_entity,
            });
            nodes[id.0].children.insert(name, child_id);
        }
        Ok(())
    }

    /// Decides what this node's children look like, without mutating the
    /// tree. Returns `(rendered_name_before_disambiguation, bindings,
    /// next_segment_index, entity)` tuples.
    async fn plan_children(
        &self,
        segment: &Segment,
        segment_index: usize,
        bindings: &Bindings,
        parent_entity: Option<&Entity>,
    ) -> Result<Vec<(String, Bindings, usize, Option<Entity>)>, NodeExpansionError> {
        let bound_through = bindings.bound_through();
        let segment_level = segment.level();

        if let Some(token) = segment.is_recursive_path_segment() {
            return self.plan_recursive_folder_children(token, segment_index, bindings, parent_entity).await;
        }

        let introduces_new_level = match (segment_level, bound_through) {
            (Some(_), None) => true,
            (Some(lvl), Some(bound)) => lvl > bound,
            (None, _) => false,
        };

        if !introduces_new_level {
            // Pure decoration of already-bound entities, or a literal
            // directory layer: exactly one child.
            let name = segment.render(bindings, &self.generic_roots);
            return Ok(vec![(name, bindings.clone(), segment_index + 1, parent_entity.cloned())]);
        }

        match segment_level.expect("introduces_new_level implies Some") {
            Level::Semester => {
                let semesters = self.crawler.list_semesters().await.map_err(NodeExpansionError::from)?;
                Ok(semesters
                    .iter()
                    .map(|semester| {
                        let mut b = bindings.clone();
                        b.semester = Some(semester.clone());
                        let name = segment.render(&b, &self.generic_roots);
                        (name, b, segment_index + 1, Some(Entity::Semester(semester.clone())))
                    })
                    .collect())
            }
            Level::Course => {
                let semester_id = bindings
                    .semester
                    .as_ref()
                    .map(|s| s.id.clone())
                    .ok_or_else(|| NodeExpansionError::from(CrawlError::Protocol(
                        "course-level segment reached with no semester bound".into(),
                    )))?;
                let courses = self.crawler.list_courses(&semester_id).await.map_err(NodeExpansionError::from)?;
                Ok(courses
                    .iter()
                    .map(|course| {
                        let mut b = bindings.clone();
                        b.course = Some(course.clone());
                        let name = segment.render(&b, &self.generic_roots);
                        (name, b, segment_index + 1, Some(Entity::Course(course.clone())))
                    })
                    .collect())
            }
            Level::Folder => {
                // A non-recursive folder-level segment (no {path}/{short-path}
                // token) binds the course's single top folder.
                let course_id = bindings
                    .course
                    .as_ref()
                    .map(|c| c.id.clone())
                    .ok_or_else(|| NodeExpansionError::from(CrawlError::Protocol(
                        "folder-level segment reached with no course bound".into(),
                    )))?;
                let top = self.crawler.top_folder(&course_id).await.map_err(NodeExpansionError::from)?;
                let mut b = bindings.clone();
                b.folder_path = vec![(*top).clone()];
                let name = segment.render(&b, &self.generic_roots);
                Ok(vec![(name, b, segment_index + 1, Some(Entity::Folder((*top).clone())))])
            }
            Level::File => {
                let folder_id = self.effective_folder_id(bindings).await?;
                let (_, files) = &*self.crawler.list_folder(&folder_id).await.map_err(NodeExpansionError::from)?;
                Ok(files
                    .iter()
                    .map(|file| {
                        let mut b = bindings.clone();
                        b.file = Some(file.clone());
                        let name = segment.render(&b, &self.generic_roots);
                        (name, b, segment_index + 1, Some(Entity::File(file.clone())))
                    })
                    .collect())
            }
        }
    }

    /// Resolves the folder id files should be listed from when no explicit
    /// `{path}`/`{short-path}` segment bound one: the course's top folder,
    /// fetched lazily (spec §4.3, the "skip straight to files" shape).
    async fn effective_folder_id(&self, bindings: &Bindings) -> Result<String, NodeExpansionError> {
        if let Some(folder) = bindings.folder_path.last() {
            return Ok(folder.id.clone());
        }
        let course_id = bindings
            .course
            .as_ref()
            .map(|c| c.id.clone())
            .ok_or_else(|| NodeExpansionError::from(CrawlError::Protocol(
                "file-level segment reached with no course or folder bound".into(),
            )))?;
        let top = self.crawler.top_folder(&course_id).await.map_err(NodeExpansionError::from)?;
        Ok(top.id.clone())
    }

    /// The `{path}`/`{short-path}` segment materializes one real directory
    /// per folder in the subtree instead of a single slash-embedding name
    /// (spec §8 scenario 3). A folder's own children are its subfolders
    /// (recursing on the same segment) plus its files (advancing to the
    /// next segment).
    async fn plan_recursive_folder_children(
        &self,
        token: crate::token::Token,
        segment_index: usize,
        bindings: &Bindings,
        _parent_entity: Option<&Entity>,
    ) -> Result<Vec<(String, Bindings, usize, Option<Entity>)>, NodeExpansionError> {
        if bindings.folder_path.last().is_some() {
            // Already inside the folder tree: list the bound folder's own
            // children (recursive case).
            return self.list_folder_chain_children(token, segment_index, bindings).await;
        }

        // First entry into the recursive segment: resolve the course's top
        // folder before anything underneath it can be listed.
        let course_id = bindings
            .course
            .as_ref()
            .map(|c| c.id.clone())
            .ok_or_else(|| {
                NodeExpansionError::from(CrawlError::Protocol(
                    "path segment reached with no course bound".into(),
                ))
            })?;
        let top = self.crawler.top_folder(&course_id).await.map_err(NodeExpansionError::from)?;
        let mut bound = bindings.clone();
        bound.folder_path = vec![(*top).clone()];

        // `{short-path}` elides only the outermost generic-root folder
        // (spec §9 Open Question): its children are promoted to this level
        // instead of the folder itself appearing as a directory.
        if matches!(token, crate::token::Token::ShortPath) && self.generic_roots.contains(&top.name) {
            return self.list_folder_chain_children(token, segment_index, &bound).await;
        }

        Ok(vec![(top.name.clone(), bound, segment_index, Some(Entity::Folder((*top).clone())))])
    }

    async fn list_folder_chain_children(
        &self,
        token: crate::token::Token,
        segment_index: usize,
        bindings: &Bindings,
    ) -> Result<Vec<(String, Bindings, usize, Option<Entity>)>, NodeExpansionError> {
        let folder_id = bindings
            .folder_path
            .last()
            .expect("caller always binds the current folder before listing it")
            .id
            .clone();
        let (subfolders, files) =
            &*self.crawler.list_folder(&folder_id).await.map_err(NodeExpansionError::from)?;

        let mut out = Vec::with_capacity(subfolders.len() + files.len());
        for folder in subfolders {
            let mut b = bindings.clone();
            b.folder_path.push(folder.clone());
            out.push((folder.name.clone(), b, segment_index, Some(Entity::Folder(folder.clone()))));
        }
        for file in files {
            let mut b = bindings.clone();
            b.file = Some(file.clone());
            let name = token::render(crate::token::Token::FileName, &b, &self.generic_roots);
            out.push((name, b, segment_index + 1, Some(Entity::File(file.clone()))));
        }
        Ok(out)
    }
}

/// Applies the disambiguation rule (spec §4.3 step 4): every name that two
/// or more siblings would render to gets a parenthesized suffix built from
/// the lowest-bound entity's id prefix, applied uniformly so the outcome
/// does not depend on enumeration order.
fn disambiguate(
    planned: Vec<(String, Bindings, usize, Option<Entity>)>,
) -> Vec<(String, Bindings, usize, Option<Entity>)> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for (name, _, _, _) in &planned {
        *counts.entry(name.clone()).or_insert(0) += 1;
    }

    planned
        .into_iter()
        .map(|(name, bindings, next_index, entity)| {
            if counts.get(&name).copied().unwrap_or(0) > 1 {
                let prefix = entity
                    .as_ref()
                    .map(|e| e.id_prefix())
                    .unwrap_or_else(|| "0".repeat(8));
                (format!("{name} ({prefix})"), bindings, next_index, entity)
            } else {
                (name, bindings, next_index, entity)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::fake::FakeRemoteSource;
    use crate::entity::{Course, Semester};
    use chrono::Utc;
    use std::collections::HashMap;

    fn semester(id: &str, title: &str) -> Semester {
        Semester { id: id.into(), title: title.into(), begin: Utc::now(), end: Utc::now() }
    }

    fn course(id: &str, title: &str) -> Course {
        Course {
            id: id.into(),
            title: title.into(),
            number: String::new(),
            subtitle: String::new(),
            description: String::new(),
            group: String::new(),
            location: String::new(),
            class: String::new(),
            course_type: String::new(),
            type_short: String::new(),
            semester_ids: vec![],
        }
    }

    async fn build_resolver(template: &str) -> Resolver<FakeRemoteSource> {
        let mut courses = HashMap::new();
        courses.insert(
            "s1".to_string(),
            vec![course("c1", "Algorithmen und Datenstrukturen"), course("c2", "Advanced Databases")],
        );
        let fake = FakeRemoteSource {
            semesters: vec![semester("s1", "Wintersemester 2018/19")],
            courses,
            ..Default::default()
        };
        let crawler = Arc::new(Crawler::new(fake, 4));
        let compiled = Template::compile(template).unwrap();
        Resolver::new(compiled, crawler, token::default_generic_roots())
    }

    #[tokio::test]
    async fn readdir_on_root_lists_semesters() {
        let resolver = build_resolver("{semester-lexical-short}/{course-abbrev}").await;
        let children = resolver.readdir(NodeId::ROOT).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].0, "2018WS");
    }

    #[tokio::test]
    async fn readdir_is_stable_across_repeated_calls() {
        let resolver = build_resolver("{semester-lexical-short}/{course-abbrev}").await;
        let first = resolver.readdir(NodeId::ROOT).await.unwrap();
        let second = resolver.readdir(NodeId::ROOT).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn course_level_listing_uses_abbreviations() {
        let resolver = build_resolver("{semester-lexical-short}/{course-abbrev}").await;
        let semester_children = resolver.readdir(NodeId::ROOT).await.unwrap();
        let (_, semester_node) = &semester_children[0];
        let courses = resolver.readdir(*semester_node).await.unwrap();
        let names: Vec<_> = courses.iter().map(|(n, _)| n.clone()).collect();
        assert!(names.contains(&"AuD".to_string()));
        assert!(names.contains(&"AD".to_string()));
    }
}
