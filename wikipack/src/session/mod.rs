// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Per-(user, ref) pack sessions: a command dispatcher over the
//! staged deployment plan, returning partial diffs and collision
//! warnings, with state-hash based client synchronization.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use log::warn;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

use crate::apply;
use crate::content::normalize_url;
use crate::db::{self, operation::Kind, page, pack};
use crate::operation;
use crate::store::{Entry, Store};
use crate::title;
use crate::wiki;

pub use self::command::Command;
pub use self::state::{Action, PackState, PageState, State};

pub mod command;
pub mod diff;
pub mod state;

/// How many prior states are kept for reconciling stale clients
const HISTORY_LIMIT: usize = 8;

/// Everything a command returns to the client
#[derive(Debug)]
pub struct Outcome {
    pub diff: Value,
    pub state_hash: String,
    pub warnings: Vec<String>,
    /// init and clear replace client state instead of merging
    pub replace: bool,
    pub operation: Option<String>,
    pub differences: Option<Value>,
    pub reconcile: Option<Vec<Value>>,
}

/// One session: the staged plan for a (user, ref) pair
struct Session {
    ref_id: i64,
    state: State,
    hash: String,
    /// Declared name -> staged rename of the base title
    renames: BTreeMap<(String, String), String>,
    /// Wiki titles snapshotted at session creation / refresh
    external_titles: BTreeSet<String>,
    /// Recent (hash, state) pairs for stale-client reconciliation
    history: VecDeque<(String, State)>,
}

/// Registry view loaded before each command so handlers stay
/// synchronous
struct Context {
    installed: BTreeMap<String, pack::Pack>,
    pages: BTreeMap<(String, String), page::Page>,
}

impl Context {
    async fn load(db: &db::Database, ref_id: i64) -> Result<Self, db::Error> {
        let packs = db.list_packs(ref_id).await?;

        let mut pages = BTreeMap::new();
        let by_id: HashMap<i64, &pack::Pack> = packs.iter().map(|p| (p.id, p)).collect();

        for page in db.list_pages_for_ref(ref_id).await? {
            if let Some(owner) = by_id.get(&page.pack_id) {
                pages.insert((owner.name.clone(), page.name.clone()), page);
            }
        }

        Ok(Self {
            installed: packs.into_iter().map(|p| (p.name.clone(), p)).collect(),
            pages,
        })
    }
}

pub struct Engine {
    db: db::Database,
    store: Arc<Store>,
    wiki: Arc<dyn wiki::Client>,
    operations: Arc<operation::Runtime>,
    apply_timeout: Option<Duration>,
    sessions: Mutex<HashMap<(String, i64), Arc<Mutex<Session>>>>,
    apply_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl Engine {
    pub fn new(
        db: db::Database,
        store: Arc<Store>,
        wiki: Arc<dyn wiki::Client>,
        operations: Arc<operation::Runtime>,
        apply_timeout: Option<Duration>,
    ) -> Self {
        Self {
            db,
            store,
            wiki,
            operations,
            apply_timeout,
            sessions: Mutex::new(HashMap::new()),
            apply_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn operations(&self) -> &Arc<operation::Runtime> {
        &self.operations
    }

    /// Dispatch one command for (user, repo, ref). Commands of a
    /// session are serialized; the diff stream therefore has a total
    /// order.
    pub async fn handle(
        &self,
        user: &str,
        repo_url: &Url,
        source_ref: &str,
        client_hash: Option<&str>,
        command: Command,
    ) -> Result<Outcome, Error> {
        let normalized = normalize_url(repo_url);

        let repo = self
            .db
            .repo_by_url(&normalized)
            .await?
            .ok_or_else(|| Error::UnknownRepo(normalized.clone()))?;
        let reference = self
            .db
            .ref_by_key(repo.id, source_ref)
            .await?
            .ok_or_else(|| Error::UnknownRef {
                url: normalized.clone(),
                source_ref: source_ref.to_owned(),
            })?;

        let entry = self.store.get(repo_url, source_ref).await?.data;
        let context = Context::load(&self.db, reference.id).await?;

        let session = self.session(user, reference.id, &entry, &context).await?;
        let mut session = session.lock().await;

        // stale clients get differences + a reconcile plan, never a
        // silent merge
        if let Some(client_hash) = client_hash {
            if client_hash != session.hash && !command.replaces_state() {
                let (differences, reconcile) = self.differences(&session, client_hash)?;

                return Ok(Outcome {
                    diff: json!({}),
                    state_hash: session.hash.clone(),
                    warnings: warnings(&session, &entry, &context),
                    replace: false,
                    operation: None,
                    differences: Some(differences),
                    reconcile: Some(reconcile),
                });
            }
        }

        let previous = (session.hash.clone(), session.state.clone());
        let mut operation_id = None;

        let (diff, replace) = match &command {
            Command::Init | Command::Clear => {
                session.renames.clear();
                session.state = seed(&entry, &context);
                (session.state.to_value(), true)
            }
            Command::SetPackAction { pack_name, action } => {
                set_pack_action(&mut session, &entry, pack_name, *action)?;
                (diff::between(&previous.1.to_value(), &session.state.to_value()), false)
            }
            Command::SetPackPrefix { pack_name, prefix } => {
                set_pack_prefix(&mut session, pack_name, prefix)?;
                (diff::between(&previous.1.to_value(), &session.state.to_value()), false)
            }
            Command::RenamePage {
                pack_name,
                page_name,
                new_title,
            } => {
                rename_page(&mut session, pack_name, page_name, new_title)?;
                (diff::between(&previous.1.to_value(), &session.state.to_value()), false)
            }
            Command::Apply { delete_pages } => {
                operation_id = Some(
                    self.enqueue_apply(user, &session, &entry, &reference, *delete_pages)
                        .await?,
                );
                (json!({}), false)
            }
            Command::Refresh => {
                session.external_titles = self.snapshot_titles().await;
                refresh(&mut session, &entry, &context);
                (diff::between(&previous.1.to_value(), &session.state.to_value()), false)
            }
        };

        session.hash = session.state.hash();

        if session.hash != previous.0 {
            session.history.push_front(previous);
            session.history.truncate(HISTORY_LIMIT);
        }

        Ok(Outcome {
            diff,
            state_hash: session.hash.clone(),
            warnings: warnings(&session, &entry, &context),
            replace,
            operation: operation_id,
            differences: None,
            reconcile: None,
        })
    }

    /// Get or create the session, seeding new ones from manifest and
    /// registries
    async fn session(
        &self,
        user: &str,
        ref_id: i64,
        entry: &Entry,
        context: &Context,
    ) -> Result<Arc<Mutex<Session>>, Error> {
        let key = (user.to_owned(), ref_id);

        if let Some(session) = self.sessions.lock().await.get(&key) {
            return Ok(session.clone());
        }

        let external_titles = self.snapshot_titles().await;

        let state = seed(entry, context);
        let hash = state.hash();

        let session = Arc::new(Mutex::new(Session {
            ref_id,
            state,
            hash,
            renames: BTreeMap::new(),
            external_titles,
            history: VecDeque::new(),
        }));

        // a concurrent creator may have won; use whichever landed
        Ok(self.sessions.lock().await.entry(key).or_insert(session).clone())
    }

    /// Collision warnings must not suspend inside command handlers,
    /// so the wiki's titles are captured up front
    async fn snapshot_titles(&self) -> BTreeSet<String> {
        match self.wiki.titles().await {
            Ok(titles) => titles.into_iter().collect(),
            Err(error) => {
                warn!("could not snapshot wiki titles: {error}");
                BTreeSet::new()
            }
        }
    }

    async fn enqueue_apply(
        &self,
        user: &str,
        session: &Session,
        entry: &Entry,
        reference: &db::refs::Ref,
        delete_pages: bool,
    ) -> Result<String, Error> {
        let worktree = reference
            .worktree_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or(Error::NoWorktree)?;

        let request = build_request(session, entry, reference, user, worktree, delete_pages)?;

        let orchestrator = apply::Orchestrator::new(self.db.clone(), self.wiki.clone());

        let ref_lock = {
            let mut locks = self.apply_locks.lock().await;
            locks.entry(session.ref_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };

        let session_arc = self
            .sessions
            .lock()
            .await
            .get(&(user.to_owned(), session.ref_id))
            .cloned();

        let id = self
            .operations
            .enqueue(
                Kind::PackApply,
                user,
                "applying staged packs",
                self.apply_timeout,
                Box::new(move |handle| {
                    async move {
                        // pack registry writes for this ref are
                        // exclusive for the whole apply
                        let _guard = ref_lock.lock().await;

                        let report = orchestrator
                            .run(&request, handle.cancellation(), &|percent, message| {
                                let handle = handle.clone();
                                let message = message.to_owned();
                                tokio::spawn(async move { handle.progress(percent, &message).await });
                            })
                            .await
                            .map_err(|error| operation::Completion {
                                message: error.to_string(),
                                result_data: None,
                            })?;

                        if let Some(session) = session_arc {
                            absorb_report(&mut *session.lock().await, &report);
                        }

                        let data = serde_json::to_string(&report).ok();

                        if report.success {
                            Ok(operation::Completion {
                                message: format!("applied {} pack(s)", report.installed.len()),
                                result_data: data,
                            })
                        } else {
                            Err(operation::Completion {
                                message: "apply finished with errors".to_owned(),
                                result_data: data,
                            })
                        }
                    }
                    .boxed()
                }),
            )
            .await?;

        Ok(id)
    }

    /// Field-level deltas between the state the client knows and the
    /// current one, plus commands that would replay the client's
    /// staged intent
    fn differences(&self, session: &Session, client_hash: &str) -> Result<(Value, Vec<Value>), Error> {
        let snapshot = session
            .history
            .iter()
            .find(|(hash, _)| hash == client_hash)
            .map(|(_, state)| state);

        let Some(snapshot) = snapshot else {
            // unknown hash: everything the server has, replayed by a
            // fresh init
            let mut differences = serde_json::Map::new();
            for (name, pack) in &session.state.packs {
                differences.insert(name.clone(), json!({"server": pack_value(pack)?}));
            }
            return Ok((Value::Object(differences), vec![json!({"command": "init"})]));
        };

        let mut differences = serde_json::Map::new();
        let mut reconcile = vec![];

        let names: BTreeSet<&String> = snapshot.packs.keys().chain(session.state.packs.keys()).collect();

        for name in names {
            let client = snapshot.packs.get(name);
            let server = session.state.packs.get(name);

            let client_value = pack_value(&client)?;
            let server_value = pack_value(&server)?;

            if client_value == server_value {
                continue;
            }

            differences.insert(name.clone(), field_deltas(&client_value, &server_value));

            let (Some(client), Some(server)) = (client, server) else {
                continue;
            };

            if client.action != server.action {
                reconcile.push(json!({
                    "command": "set_pack_action",
                    "pack_name": name,
                    "action": client.action,
                }));
            }

            if client.prefix != server.prefix {
                reconcile.push(json!({
                    "command": "set_pack_prefix",
                    "pack_name": name,
                    "prefix": client.prefix,
                }));
            }

            for (page_name, client_page) in &client.pages {
                let Some(server_page) = server.pages.get(page_name) else {
                    continue;
                };

                if client_page.final_title != server_page.final_title && !server_page.installed {
                    let base = client_page
                        .final_title
                        .rsplit('/')
                        .next()
                        .unwrap_or(&client_page.final_title);

                    reconcile.push(json!({
                        "command": "rename_page",
                        "pack_name": name,
                        "page_name": page_name,
                        "new_title": base,
                    }));
                }
            }
        }

        Ok((Value::Object(differences), reconcile))
    }
}

/// Session state always serializes; a failure here is an invariant
/// violation, not a client error
fn pack_value(pack: &impl serde::Serialize) -> Result<Value, Error> {
    serde_json::to_value(pack).map_err(|error| Error::Internal(format!("state serialization: {error}")))
}

/// Build the fresh session state from manifest and registries
fn seed(entry: &Entry, context: &Context) -> State {
    let mut packs = BTreeMap::new();

    for (id, declared) in &entry.manifest.packs {
        let installed_row = context.installed.get(id);

        let mut pages = BTreeMap::new();
        for name in declared.pages.keys() {
            let row = context.pages.get(&(id.clone(), name.clone()));

            pages.insert(
                name.clone(),
                PageState {
                    installed: row.is_some(),
                    final_title: row.map(|r| r.final_title.clone()).unwrap_or_else(|| name.clone()),
                    original_title: name.clone(),
                },
            );
        }

        packs.insert(
            id.clone(),
            PackState {
                action: Action::Unchanged,
                current_version: installed_row.map(|row| row.version.clone()),
                target_version: Some(declared.version.to_string()),
                installed: installed_row.is_some(),
                prefix: String::new(),
                auto_selected_reason: None,
                pages,
            },
        );
    }

    // rows the manifest no longer declares can still be removed
    for (name, row) in &context.installed {
        if packs.contains_key(name) {
            continue;
        }

        let pages = context
            .pages
            .iter()
            .filter(|((pack, _), _)| pack == name)
            .map(|((_, page_name), page)| {
                (
                    page_name.clone(),
                    PageState {
                        installed: true,
                        final_title: page.final_title.clone(),
                        original_title: page_name.clone(),
                    },
                )
            })
            .collect();

        packs.insert(
            name.clone(),
            PackState {
                action: Action::Unchanged,
                current_version: Some(row.version.clone()),
                target_version: None,
                installed: true,
                prefix: String::new(),
                auto_selected_reason: None,
                pages,
            },
        );
    }

    State { packs }
}

/// Rebuild from the registries, keeping staged choices that are
/// still legal
fn refresh(session: &mut Session, entry: &Entry, context: &Context) {
    let staged = session.state.clone();
    let mut state = seed(entry, context);

    for (name, pack) in &mut state.packs {
        let Some(previous) = staged.packs.get(name) else {
            continue;
        };

        if previous.action != Action::Unchanged && previous.action.allowed(pack.installed) {
            pack.action = previous.action;
            pack.auto_selected_reason = previous.auto_selected_reason.clone();
        }

        if pack.action.writes_pages() {
            pack.prefix = previous.prefix.clone();
            retitle(session_renames(&session.renames, name), pack);
        }
    }

    session.state = state;
}

fn session_renames<'a>(
    renames: &'a BTreeMap<(String, String), String>,
    pack: &str,
) -> impl Fn(&str) -> Option<&'a str> {
    let pack = pack.to_owned();
    move |page: &str| {
        renames
            .get(&(pack.clone(), page.to_owned()))
            .map(String::as_str)
    }
}

/// Recompute final titles of all not-yet-installed pages of a pack
fn retitle<'a>(rename_of: impl Fn(&str) -> Option<&'a str>, pack: &mut PackState) {
    let prefix = pack.prefix.clone();

    for (page_name, page) in &mut pack.pages {
        if page.installed {
            continue;
        }

        page.final_title = title::resolve(&prefix, rename_of(page_name), &page.original_title);
    }
}

fn set_pack_action(
    session: &mut Session,
    entry: &Entry,
    pack_name: &str,
    action: Action,
) -> Result<(), Error> {
    let pack = session
        .state
        .packs
        .get_mut(pack_name)
        .ok_or_else(|| Error::UnknownPack(pack_name.to_owned()))?;

    if !action.allowed(pack.installed) {
        return Err(Error::IllegalTransition {
            pack: pack_name.to_owned(),
            action,
            installed: pack.installed,
        });
    }

    // install and update need a manifest entry to read pages from
    if action.writes_pages() && !entry.manifest.packs.contains_key(pack_name) {
        return Err(Error::NotInManifest(pack_name.to_owned()));
    }

    pack.action = action;
    pack.auto_selected_reason = None;

    match action {
        Action::Install => close_over_install(session, entry, pack_name),
        Action::Remove => close_over_remove(session, entry, pack_name),
        _ => {}
    }

    Ok(())
}

/// Installing a pack pulls in its transitive dependencies that are
/// not installed yet; ties resolve in name order
fn close_over_install(session: &mut Session, entry: &Entry, root: &str) {
    let mut queue = VecDeque::from([root.to_owned()]);

    while let Some(name) = queue.pop_front() {
        let Some(declared) = entry.manifest.packs.get(&name) else {
            continue;
        };

        let mut dependencies: Vec<&String> = declared.depends_on.iter().collect();
        dependencies.sort();

        for dependency in dependencies {
            let Some(state) = session.state.packs.get_mut(dependency) else {
                continue;
            };

            if state.installed || state.action == Action::Install {
                continue;
            }

            state.action = Action::Install;
            state.auto_selected_reason = Some(format!("required by {name}"));
            queue.push_back(dependency.clone());
        }
    }
}

/// Removing a pack drags installed dependents along, so the ref
/// never holds a pack with a missing dependency
fn close_over_remove(session: &mut Session, entry: &Entry, root: &str) {
    let mut queue = VecDeque::from([root.to_owned()]);

    while let Some(name) = queue.pop_front() {
        let dependents: Vec<String> = session
            .state
            .packs
            .keys()
            .filter(|candidate| {
                entry
                    .manifest
                    .packs
                    .get(*candidate)
                    .is_some_and(|p| p.depends_on.contains(&name))
            })
            .cloned()
            .collect();

        for dependent in dependents {
            let Some(state) = session.state.packs.get_mut(&dependent) else {
                continue;
            };

            if !state.installed || state.action == Action::Remove {
                continue;
            }

            state.action = Action::Remove;
            state.auto_selected_reason = Some(format!("dependency of {name} removed"));
            queue.push_back(dependent);
        }
    }
}

fn set_pack_prefix(session: &mut Session, pack_name: &str, prefix: &str) -> Result<(), Error> {
    let renames = session.renames.clone();

    let pack = session
        .state
        .packs
        .get_mut(pack_name)
        .ok_or_else(|| Error::UnknownPack(pack_name.to_owned()))?;

    if !pack.action.writes_pages() {
        return Err(Error::NotStagedForWrite(pack_name.to_owned()));
    }

    pack.prefix = prefix.to_owned();
    retitle(session_renames(&renames, pack_name), pack);

    Ok(())
}

fn rename_page(session: &mut Session, pack_name: &str, page_name: &str, new_title: &str) -> Result<(), Error> {
    let pack = session
        .state
        .packs
        .get(pack_name)
        .ok_or_else(|| Error::UnknownPack(pack_name.to_owned()))?;

    if !pack.action.writes_pages() {
        return Err(Error::NotStagedForWrite(pack_name.to_owned()));
    }

    let page = pack.pages.get(page_name).ok_or_else(|| Error::UnknownPage {
        pack: pack_name.to_owned(),
        page: page_name.to_owned(),
    })?;

    if page.installed {
        return Err(Error::PageAlreadyInstalled {
            pack: pack_name.to_owned(),
            page: page_name.to_owned(),
        });
    }

    session
        .renames
        .insert((pack_name.to_owned(), page_name.to_owned()), new_title.to_owned());

    let renames = session.renames.clone();
    let pack = session
        .state
        .packs
        .get_mut(pack_name)
        .ok_or_else(|| Error::UnknownPack(pack_name.to_owned()))?;
    retitle(session_renames(&renames, pack_name), pack);

    Ok(())
}

/// Translate the staged plan into an orchestrator request
fn build_request(
    session: &Session,
    entry: &Entry,
    reference: &db::refs::Ref,
    user: &str,
    worktree: PathBuf,
    delete_pages: bool,
) -> Result<apply::Request, Error> {
    let mut installs = vec![];
    let mut updates = vec![];
    let mut removes = vec![];

    for (name, pack) in &session.state.packs {
        match pack.action {
            Action::Unchanged => {}
            Action::Remove => removes.push(name.clone()),
            Action::Install | Action::Update => {
                let declared = entry
                    .manifest
                    .packs
                    .get(name)
                    .ok_or_else(|| Error::NotInManifest(name.clone()))?;

                let plan = apply::PackPlan {
                    name: name.clone(),
                    version: declared.version.to_string(),
                    source_commit: reference.last_commit.clone(),
                    depends_on: declared.depends_on.clone(),
                    pages: declared
                        .pages
                        .iter()
                        .map(|(page_name, declaration)| apply::PagePlan {
                            name: page_name.clone(),
                            final_title: pack
                                .pages
                                .get(page_name)
                                .map(|p| p.final_title.clone())
                                .unwrap_or_else(|| page_name.clone()),
                            file: worktree.join(&declaration.file),
                        })
                        .collect(),
                };

                if pack.action == Action::Install {
                    installs.push(plan);
                } else {
                    updates.push(plan);
                }
            }
        }
    }

    Ok(apply::Request {
        ref_id: session.ref_id,
        user: user.to_owned(),
        installs,
        updates,
        removes,
        delete_pages,
    })
}

/// Fold a finished apply back into the staged state
fn absorb_report(session: &mut Session, report: &apply::Report) {
    for name in &report.installed {
        if let Some(pack) = session.state.packs.get_mut(name) {
            pack.action = Action::Unchanged;
            pack.current_version = pack.target_version.clone();
            pack.installed = true;
            pack.auto_selected_reason = None;

            for page in pack.pages.values_mut() {
                page.installed = true;
            }
        }
    }

    for name in &report.removed {
        if let Some(pack) = session.state.packs.get_mut(name) {
            pack.action = Action::Unchanged;
            pack.current_version = None;
            pack.installed = false;
            pack.auto_selected_reason = None;

            for page in pack.pages.values_mut() {
                page.installed = false;
            }
        }
    }

    session.hash = session.state.hash();
}

/// Collision and policy warnings, recomputed on every command
fn warnings(session: &Session, entry: &Entry, context: &Context) -> Vec<String> {
    let mut warnings = vec![];

    // titles already owned by an installed page of some pack
    let owned: BTreeMap<&str, &str> = context
        .pages
        .iter()
        .map(|((pack, _), page)| (page.final_title.as_str(), pack.as_str()))
        .collect();

    let mut staged_titles: BTreeMap<&str, &str> = BTreeMap::new();

    for (name, pack) in &session.state.packs {
        if !pack.action.writes_pages() {
            continue;
        }

        for page in pack.pages.values() {
            if page.installed {
                continue;
            }

            if session.external_titles.contains(&page.final_title)
                && owned.get(page.final_title.as_str()) != Some(&name.as_str())
            {
                warnings.push(format!(
                    "page '{}' already exists on the wiki (pack {name})",
                    page.final_title
                ));
            }

            if let Some(other) = staged_titles.get(page.final_title.as_str()) {
                if *other != name.as_str() {
                    warnings.push(format!(
                        "packs {other} and {name} both write page '{}'",
                        page.final_title
                    ));
                }
            } else {
                staged_titles.insert(page.final_title.as_str(), name.as_str());
            }
        }

        // dependencies must end up installed or staged alongside
        let Some(declared) = entry.manifest.packs.get(name) else {
            continue;
        };

        for dependency in &declared.depends_on {
            let satisfied = session
                .state
                .packs
                .get(dependency)
                .map(|dep| (dep.installed && dep.action != Action::Remove) || dep.action == Action::Install)
                .unwrap_or(false);

            if !satisfied {
                warnings.push(format!(
                    "pack {name} requires {dependency}, which is neither installed nor selected"
                ));
            }
        }
    }

    warnings
}

/// Nested {client, server} leaves for every differing field
fn field_deltas(client: &Value, server: &Value) -> Value {
    match (client, server) {
        (Value::Object(client_map), Value::Object(server_map)) => {
            let mut out = serde_json::Map::new();
            let keys: BTreeSet<&String> = client_map.keys().chain(server_map.keys()).collect();

            for key in keys {
                let left = client_map.get(key).unwrap_or(&Value::Null);
                let right = server_map.get(key).unwrap_or(&Value::Null);

                if left != right {
                    out.insert(key.clone(), field_deltas(left, right));
                }
            }

            Value::Object(out)
        }
        _ => json!({"client": client, "server": server}),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown repository {0}")]
    UnknownRepo(String),
    #[error("unknown ref {source_ref} for {url}")]
    UnknownRef { url: String, source_ref: String },
    #[error("unknown pack {0}")]
    UnknownPack(String),
    #[error("unknown page {page} in pack {pack}")]
    UnknownPage { pack: String, page: String },
    #[error("pack {pack} cannot be staged as {action:?} (installed: {installed})")]
    IllegalTransition {
        pack: String,
        action: Action,
        installed: bool,
    },
    #[error("pack {0} is not staged for install or update")]
    NotStagedForWrite(String),
    #[error("page {page} of pack {pack} is already installed and cannot be renamed")]
    PageAlreadyInstalled { pack: String, page: String },
    #[error("pack {0} is not declared by the manifest")]
    NotInManifest(String),
    #[error("ref has no worktree to read page files from")]
    NoWorktree,
    #[error("internal: {0}")]
    Internal(String),
    #[error(transparent)]
    Store(#[from] crate::store::Error),
    #[error("registry: {0}")]
    Database(#[from] db::Error),
    #[error(transparent)]
    Operations(#[from] operation::Error),
}

#[cfg(test)]
mod test {
    use serde_json::json;
    use tempfile::TempDir;

    use crate::db::{refs, Clock, Database};
    use crate::wiki::Client;

    use super::*;

    const MANIFEST: &str = r#"
schema_version: "1.0.0"
packs:
  Core:
    version: "1.0.0"
    pages:
      Home: { file: core/Home.wiki }
  UI:
    version: "1.0.0"
    depends_on: [Core]
    pages:
      Dashboard: { file: ui/Dashboard.wiki }
  Publication:
    version: "2.0.0"
    pages:
      Home: { file: pub/Home.wiki }
      "Template:Card": { file: pub/Card.wiki }
"#;

    struct Fixture {
        engine: Engine,
        wiki: Arc<wiki::Memory>,
        db: Database,
        url: Url,
        _worktree: TempDir,
    }

    async fn fixture() -> Fixture {
        let worktree = TempDir::new().unwrap();
        std::fs::write(worktree.path().join("manifest.yml"), MANIFEST).unwrap();
        for (dir, file, body) in [
            ("core", "Home.wiki", "= Core home ="),
            ("ui", "Dashboard.wiki", "= Dashboard ="),
            ("pub", "Home.wiki", "= Pub home ="),
            ("pub", "Card.wiki", "card template"),
        ] {
            std::fs::create_dir_all(worktree.path().join(dir)).unwrap();
            std::fs::write(worktree.path().join(dir).join(file), body).unwrap();
        }

        let db = Database::memory(Clock::system()).await.unwrap();
        let url = Url::parse("https://git.example/content").unwrap();

        let repo = db
            .add_repo("https://git.example/content", "main", "/cache/x.git")
            .await
            .unwrap();
        db.update_repo(
            repo.id,
            crate::db::repo::Change {
                last_fetched: Some(1_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        db.ensure_ref(
            repo.id,
            "main",
            refs::Change {
                last_commit: Some("abc123".to_owned()),
                worktree_path: Some(worktree.path().to_string_lossy().into_owned()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let wiki = Arc::new(wiki::Memory::new());
        let store = Arc::new(Store::new(db.clone()));
        let operations = operation::Runtime::new(db.clone(), 2, 16);

        Fixture {
            engine: Engine::new(db.clone(), store, wiki.clone(), operations, None),
            wiki,
            db,
            url,
            _worktree: worktree,
        }
    }

    impl Fixture {
        async fn handle(&self, command: Command) -> Outcome {
            self.engine
                .handle("alice", &self.url, "main", None, command)
                .await
                .unwrap()
        }

        async fn apply_and_wait(&self) {
            let outcome = self.handle(Command::Apply { delete_pages: false }).await;
            let id = outcome.operation.unwrap();

            let finished = self
                .engine
                .operations()
                .poll(&id, Duration::from_secs(5), Duration::from_millis(10), |_| {})
                .await
                .unwrap();

            assert_eq!(finished.status, crate::db::operation::Status::Success, "{finished:?}");
        }
    }

    #[tokio::test]
    async fn init_seeds_and_is_idempotent() {
        let fixture = fixture().await;

        let first = fixture.handle(Command::Init).await;
        assert!(first.replace);
        assert_eq!(first.diff.pointer("/packs/Core/action"), Some(&json!("unchanged")));
        assert_eq!(first.diff.pointer("/packs/Core/installed"), Some(&json!(false)));
        assert_eq!(first.diff.pointer("/packs/UI/target_version"), Some(&json!("1.0.0")));
        assert_eq!(first.diff.pointer("/packs/Core/current_version"), Some(&json!(null)));

        let second = fixture.handle(Command::Init).await;
        assert_eq!(first.state_hash, second.state_hash);
    }

    #[tokio::test]
    async fn install_selects_dependencies() {
        let fixture = fixture().await;
        fixture.handle(Command::Init).await;

        let outcome = fixture
            .handle(Command::SetPackAction {
                pack_name: "UI".to_owned(),
                action: Action::Install,
            })
            .await;

        assert_eq!(outcome.diff.pointer("/packs/UI/action"), Some(&json!("install")));
        assert_eq!(outcome.diff.pointer("/packs/Core/action"), Some(&json!("install")));
        assert_eq!(
            outcome.diff.pointer("/packs/Core/auto_selected_reason"),
            Some(&json!("required by UI"))
        );

        fixture.apply_and_wait().await;

        // both pack rows landed and the wiki holds the pages
        assert!(fixture.wiki.exists("Home").await.unwrap());
        assert!(fixture.wiki.exists("Dashboard").await.unwrap());

        let refreshed = fixture.handle(Command::Init).await;
        assert_eq!(refreshed.diff.pointer("/packs/UI/installed"), Some(&json!(true)));
        assert_eq!(
            refreshed.diff.pointer("/packs/UI/current_version"),
            Some(&json!("1.0.0"))
        );
    }

    #[tokio::test]
    async fn removing_dependency_drags_dependents() {
        let fixture = fixture().await;
        fixture.handle(Command::Init).await;
        fixture
            .handle(Command::SetPackAction {
                pack_name: "UI".to_owned(),
                action: Action::Install,
            })
            .await;
        fixture.apply_and_wait().await;

        let outcome = fixture
            .handle(Command::SetPackAction {
                pack_name: "Core".to_owned(),
                action: Action::Remove,
            })
            .await;

        assert_eq!(outcome.diff.pointer("/packs/Core/action"), Some(&json!("remove")));
        assert_eq!(outcome.diff.pointer("/packs/UI/action"), Some(&json!("remove")));
        assert_eq!(
            outcome.diff.pointer("/packs/UI/auto_selected_reason"),
            Some(&json!("dependency of Core removed"))
        );
    }

    #[tokio::test]
    async fn prefix_rewrites_titles_preserving_namespace() {
        let fixture = fixture().await;
        fixture.handle(Command::Init).await;
        fixture
            .handle(Command::SetPackAction {
                pack_name: "Publication".to_owned(),
                action: Action::Install,
            })
            .await;

        let outcome = fixture
            .handle(Command::SetPackPrefix {
                pack_name: "Publication".to_owned(),
                prefix: "Pubs".to_owned(),
            })
            .await;

        assert_eq!(
            outcome.diff.pointer("/packs/Publication/pages/Home/final_title"),
            Some(&json!("Pubs/Home"))
        );
        assert_eq!(
            outcome
                .diff
                .pointer("/packs/Publication/pages/Template:Card/final_title"),
            Some(&json!("Template:Pubs/Card"))
        );
    }

    #[tokio::test]
    async fn rename_survives_prefix_change() {
        let fixture = fixture().await;
        fixture.handle(Command::Init).await;
        fixture
            .handle(Command::SetPackAction {
                pack_name: "Publication".to_owned(),
                action: Action::Install,
            })
            .await;
        fixture
            .handle(Command::RenamePage {
                pack_name: "Publication".to_owned(),
                page_name: "Home".to_owned(),
                new_title: "Index".to_owned(),
            })
            .await;

        let outcome = fixture
            .handle(Command::SetPackPrefix {
                pack_name: "Publication".to_owned(),
                prefix: "Pubs".to_owned(),
            })
            .await;

        assert_eq!(
            outcome.diff.pointer("/packs/Publication/pages/Home/final_title"),
            Some(&json!("Pubs/Index"))
        );
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let fixture = fixture().await;
        fixture.handle(Command::Init).await;

        let err = fixture
            .engine
            .handle(
                "alice",
                &fixture.url,
                "main",
                None,
                Command::SetPackAction {
                    pack_name: "Core".to_owned(),
                    action: Action::Update,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::IllegalTransition { .. }));

        let err = fixture
            .engine
            .handle(
                "alice",
                &fixture.url,
                "main",
                None,
                Command::SetPackPrefix {
                    pack_name: "Core".to_owned(),
                    prefix: "X".to_owned(),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotStagedForWrite(_)));
    }

    #[tokio::test]
    async fn stale_hash_returns_differences_without_mutation() {
        let fixture = fixture().await;
        let initial = fixture.handle(Command::Init).await;

        let staged = fixture
            .handle(Command::SetPackAction {
                pack_name: "Core".to_owned(),
                action: Action::Install,
            })
            .await;

        // a second tab still holding the init-era hash
        let outcome = fixture
            .engine
            .handle(
                "alice",
                &fixture.url,
                "main",
                Some(&initial.state_hash),
                Command::SetPackPrefix {
                    pack_name: "Core".to_owned(),
                    prefix: "Pubs".to_owned(),
                },
            )
            .await
            .unwrap();

        let differences = outcome.differences.unwrap();
        assert!(differences.get("Core").is_some());
        assert_eq!(
            differences.pointer("/Core/action/client"),
            Some(&json!("unchanged"))
        );
        assert_eq!(
            differences.pointer("/Core/action/server"),
            Some(&json!("install"))
        );
        assert!(outcome.reconcile.is_some());

        // server state must be untouched
        assert_eq!(outcome.state_hash, staged.state_hash);
        let current = fixture.handle(Command::Refresh).await;
        assert_eq!(current.diff.pointer("/packs/Core/prefix"), None);
    }

    #[tokio::test]
    async fn unknown_stale_hash_reconciles_via_init() {
        let fixture = fixture().await;
        fixture.handle(Command::Init).await;

        let outcome = fixture
            .engine
            .handle(
                "alice",
                &fixture.url,
                "main",
                Some("deadbeef"),
                Command::Refresh,
            )
            .await
            .unwrap();

        assert!(outcome.differences.is_some());
        assert_eq!(outcome.reconcile.unwrap(), vec![json!({"command": "init"})]);
    }

    #[tokio::test]
    async fn external_collision_warns() {
        let fixture = fixture().await;
        fixture.wiki.seed("Dashboard", "someone else's page").await;

        fixture.handle(Command::Init).await;
        let outcome = fixture
            .handle(Command::SetPackAction {
                pack_name: "UI".to_owned(),
                action: Action::Install,
            })
            .await;

        assert!(outcome
            .warnings
            .iter()
            .any(|w| w.contains("Dashboard") && w.contains("already exists")));
    }

    #[tokio::test]
    async fn clear_resets_to_fresh_state() {
        let fixture = fixture().await;
        let initial = fixture.handle(Command::Init).await;

        fixture
            .handle(Command::SetPackAction {
                pack_name: "Core".to_owned(),
                action: Action::Install,
            })
            .await;

        let cleared = fixture.handle(Command::Clear).await;

        assert!(cleared.replace);
        assert_eq!(cleared.state_hash, initial.state_hash);
        assert_eq!(cleared.diff.pointer("/packs/Core/action"), Some(&json!("unchanged")));
    }
}
