//! The service class user.
//!
//! Every operation proposes the presentation contexts it needs,
//! opens its own association, runs one exchange
//! and releases the association again.
//! The proposed contexts are removed from the request template
//! whatever the outcome.
use crate::cache::{CacheInvalidator, CacheKey, ResultCache};
use crate::dispatch::{self, ActiveAssociation, Responses};
use crate::options::ScuOptions;
use crate::query;
use crate::retrieve::{self, uid_of, StudyBatch};
use crate::store::{self, StoreParams, StoreSource};
use dicom_dictionary_std::{tags, uids};
use dicom_object::InMemDicomObject;
use dimse_ul::association::{
    self, propose_context, AssociationRequest, Connector, ProposedContext, TcpConnector,
};
use dimse_ul::command::{self, Priority};
use dimse_ul::status::StatusKind;
use dimse_ul::{DataSource, DimseMessage, ReleaseMode, RoleSelection};
use snafu::{ResultExt, Snafu};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

const FIND: &str = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND;
const GET: &str = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET;
const MOVE: &str = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not start the cache invalidation thread
    SpawnInvalidator { source: std::io::Error },

    /// could not establish an association
    Association { source: association::Error },

    /// message exchange failed
    Dispatch { source: dispatch::Error },

    /// could not prepare the instance to store
    Store { source: store::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The outcome of a C-GET.
#[derive(Debug, Clone, Default)]
pub struct Retrieved {
    /// the identifiers of the pending responses
    pub identifiers: Vec<InMemDicomObject>,
    /// the instances received through C-STORE sub-operations
    pub instances: Vec<InMemDicomObject>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes proposed presentation contexts from the template when dropped.
struct ContextGuard<'a> {
    request: &'a Mutex<AssociationRequest>,
    ids: Vec<u8>,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        let mut request = lock(self.request);
        for id in &self.ids {
            request.remove_context(*id);
        }
    }
}

/// A DICOM service class user
/// issuing query, retrieve, storage and verification requests
/// to one peer.
///
/// Query results are cached for all operations of the same instance
/// until the next periodic invalidation.
/// All methods may be called concurrently from several threads.
///
/// # Example
///
/// ```no_run
/// # use dimse_scu::{ScuOptions, ServiceClassUser};
/// let scu = ServiceClassUser::new(
///     ScuOptions::new().called_ae_title("PACS").host("pacs.example.org").port(11112),
/// )?;
/// let studies = scu.find_studies_for_patient("P1", "DOE^JOHN")?;
/// println!("{} studies", studies.len());
/// # Ok::<(), dimse_scu::service::Error>(())
/// ```
pub struct ServiceClassUser {
    options: ScuOptions,
    connector: Arc<dyn Connector>,
    request: Mutex<AssociationRequest>,
    next_context_id: Mutex<u8>,
    cache: ResultCache,
    active: Mutex<Option<Arc<ActiveAssociation>>>,
    _invalidator: CacheInvalidator,
}

impl std::fmt::Debug for ServiceClassUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClassUser")
            .field("options", &self.options)
            .field("cache_entries", &self.cache.len())
            .finish()
    }
}

impl ServiceClassUser {
    /// Create a service class user talking to the peer over TCP.
    pub fn new(options: ScuOptions) -> Result<Self> {
        let connector = Arc::new(TcpConnector::new(options.address()));
        Self::with_connector(options, connector)
    }

    /// Create a service class user opening associations
    /// through the given connector.
    pub fn with_connector(options: ScuOptions, connector: Arc<dyn Connector>) -> Result<Self> {
        let cache = ResultCache::new();
        let invalidator = CacheInvalidator::spawn(cache.clone(), options.get_cache_interval())
            .context(SpawnInvalidatorSnafu)?;
        let mut request = AssociationRequest::new(
            options.get_calling_ae_title(),
            options.get_called_ae_title(),
        );
        request.max_pdu_length = options.get_max_pdu_length();
        Ok(ServiceClassUser {
            options,
            connector,
            request: Mutex::new(request),
            next_context_id: Mutex::new(1),
            cache,
            active: Mutex::new(None),
            _invalidator: invalidator,
        })
    }

    pub fn options(&self) -> &ScuOptions {
        &self.options
    }

    /// The presentation contexts currently proposed
    /// by operations in progress.
    pub fn pending_contexts(&self) -> Vec<ProposedContext> {
        lock(&self.request).contexts().to_vec()
    }

    /// Drop every cached query result.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Send a C-ECHO.
    ///
    /// Returns whether the peer answered with success.
    pub fn echo(&self) -> Result<bool> {
        let id = self.next_context_id();
        let context = self.context(id, uids::VERIFICATION, None);
        self.with_association(vec![context], ReleaseMode::Graceful, |association| {
            let Some(pc) = accepted(association, id, uids::VERIFICATION) else {
                return Ok(false);
            };
            let responses = association
                .invoke(move |message_id| {
                    DimseMessage::command_only(pc, command::echo_rq(message_id))
                })
                .context(DispatchSnafu)?
                .wait()
                .context(DispatchSnafu)?;
            let success = responses.is_success();
            if !success {
                warn!("C-ECHO failed with status {:04X}", responses.status().unwrap_or_default());
            }
            Ok(success)
        })
    }

    /// Find the series of one study, going through the cache.
    pub fn find_series_for_study(&self, study_uid: &str) -> Result<Vec<InMemDicomObject>> {
        let key = CacheKey::SeriesOfStudy(study_uid);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }
        let results = self.find_series_for_studies(&[study_uid.to_string()])?;
        self.cache.insert(&key, &results);
        Ok(results)
    }

    /// Find the series of the given studies.
    pub fn find_series_for_studies(&self, study_uids: &[String]) -> Result<Vec<InMemDicomObject>> {
        if study_uids.is_empty() {
            return Ok(Vec::new());
        }
        self.find(query::series_of_studies_query(study_uids))
    }

    /// Find one series, going through the cache.
    pub fn find_series(&self, series_uid: &str) -> Result<Vec<InMemDicomObject>> {
        let key = CacheKey::Series(series_uid);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }
        let results = self.find_series_list(&[series_uid.to_string()])?;
        self.cache.insert(&key, &results);
        Ok(results)
    }

    /// Find the given series.
    pub fn find_series_list(&self, series_uids: &[String]) -> Result<Vec<InMemDicomObject>> {
        if series_uids.is_empty() {
            return Ok(Vec::new());
        }
        self.find(query::series_list_query(series_uids))
    }

    /// Find the studies of a patient, going through the cache.
    pub fn find_studies_for_patient(
        &self,
        patient_id: &str,
        patient_name: &str,
    ) -> Result<Vec<InMemDicomObject>> {
        let key = CacheKey::Patient {
            called_ae_title: self.options.get_called_ae_title(),
            port: self.options.get_port(),
            host: self.options.get_host(),
            patient_id,
            patient_name,
        };
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }
        let results = self.find(query::study_query(Some((patient_id, patient_name)), &[]))?;
        self.cache.insert(&key, &results);
        Ok(results)
    }

    /// Find one study, going through the cache.
    pub fn find_study(&self, study_uid: &str) -> Result<Vec<InMemDicomObject>> {
        let key = CacheKey::Study(study_uid);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }
        let results = self.find_studies(&[study_uid.to_string()])?;
        self.cache.insert(&key, &results);
        Ok(results)
    }

    /// Find the given studies.
    pub fn find_studies(&self, study_uids: &[String]) -> Result<Vec<InMemDicomObject>> {
        if study_uids.is_empty() {
            return Ok(Vec::new());
        }
        self.find(query::study_query(None, study_uids))
    }

    /// Find the instances of the given studies and series.
    ///
    /// Studies and series with cached instances are served from the cache,
    /// only the others are queried.
    /// Instances are listed once each.
    pub fn find_instances(
        &self,
        study_uids: &[String],
        series_uids: &[String],
    ) -> Result<Vec<InMemDicomObject>> {
        let mut results = Vec::new();
        let mut series_to_query = Vec::new();
        for uid in series_uids {
            match self.cache.get(&CacheKey::InstancesOfSeries(uid)) {
                Some(cached) => results.extend(cached),
                None => series_to_query.push(uid.clone()),
            }
        }
        let mut studies_to_query = Vec::new();
        for uid in study_uids {
            match self.cache.get(&CacheKey::InstancesOfStudy(uid)) {
                Some(cached) => results.extend(cached),
                None => studies_to_query.push(uid.clone()),
            }
        }

        if !series_to_query.is_empty() || !studies_to_query.is_empty() {
            let found = self.find(query::instance_query(&studies_to_query, &series_to_query))?;
            for uid in &series_to_query {
                let matching = matching(&found, tags::SERIES_INSTANCE_UID, uid);
                self.cache.insert(&CacheKey::InstancesOfSeries(uid), &matching);
            }
            for uid in &studies_to_query {
                let matching = matching(&found, tags::STUDY_INSTANCE_UID, uid);
                self.cache.insert(&CacheKey::InstancesOfStudy(uid), &matching);
            }
            results.extend(found);
        }

        let mut seen = HashSet::new();
        results.retain(|instance| match uid_of(instance, tags::SOP_INSTANCE_UID) {
            Some(uid) => seen.insert(uid),
            None => true,
        });
        Ok(results)
    }

    /// Send a C-GET for a study, series or instance.
    ///
    /// The storage SOP classes of the options are proposed
    /// so that the peer can send the retrieved instances back.
    /// Returns `None` without contacting the peer
    /// if no identifier is given.
    pub fn get(
        &self,
        study_uid: Option<&str>,
        series_uid: Option<&str>,
        sop_instance_uid: Option<&str>,
    ) -> Result<Option<Retrieved>> {
        let Some(identifier) = query::retrieve_identifier(study_uid, series_uid, sop_instance_uid)
        else {
            return Ok(None);
        };
        let id = self.next_context_id();
        let mut contexts = vec![self.context(id, GET, None)];
        for sop_class_uid in self.options.get_retrieve_storage_classes() {
            let role = RoleSelection::new(sop_class_uid.as_str(), false, true);
            contexts.push(self.context(self.next_context_id(), sop_class_uid, Some(role)));
        }

        self.with_association(contexts, ReleaseMode::Graceful, |association| {
            let Some(pc) = accepted(association, id, GET) else {
                return Ok(None);
            };
            let responses = association
                .invoke(move |message_id| {
                    DimseMessage::outbound(
                        pc,
                        command::get_rq(message_id, GET, Priority::High),
                        Some(identifier),
                        None,
                    )
                })
                .context(DispatchSnafu)?
                .wait()
                .context(DispatchSnafu)?;
            let identifiers = identifiers(responses, "C-GET");
            let instances = association.take_received();
            debug!("C-GET received {} instances", instances.len());
            Ok(Some(Retrieved {
                identifiers,
                instances,
            }))
        })
    }

    /// Move series to another application entity.
    ///
    /// The series of the given studies, then the given series,
    /// are looked up through the cache,
    /// with one query for each kind of lookup the cache cannot serve.
    /// The series are then moved with one C-MOVE per study.
    /// Returns the series looked up, the given series first,
    /// each series once.
    pub fn move_series(
        &self,
        study_uids: &[String],
        series_uids: &[String],
        destination: &str,
    ) -> Result<Vec<InMemDicomObject>> {
        let of_studies = self.find_series_by(SeriesLookup::ByStudy, study_uids)?;
        let mut series = self.find_series_by(SeriesLookup::BySeries, series_uids)?;
        series.extend(of_studies);
        let mut seen = HashSet::new();
        series.retain(|dataset| match uid_of(dataset, tags::SERIES_INSTANCE_UID) {
            Some(uid) => seen.insert(uid),
            None => true,
        });
        for batch in retrieve::group_by_study(&series) {
            self.move_batch(&batch, destination)?;
        }
        Ok(series)
    }

    /// Look up series by study or series UID.
    ///
    /// UIDs with cached results are served from the cache,
    /// all the others are queried at once
    /// and their matches cached per UID.
    fn find_series_by(
        &self,
        lookup: SeriesLookup,
        uids: &[String],
    ) -> Result<Vec<InMemDicomObject>> {
        let mut results = Vec::new();
        let mut to_query: Vec<String> = Vec::new();
        for uid in uids {
            match self.cache.get(&lookup.key(uid)) {
                Some(cached) => results.extend(cached),
                None if !to_query.contains(uid) => to_query.push(uid.clone()),
                None => {}
            }
        }
        if to_query.is_empty() {
            return Ok(results);
        }
        let found = match lookup {
            SeriesLookup::ByStudy => self.find_series_for_studies(&to_query)?,
            SeriesLookup::BySeries => self.find_series_list(&to_query)?,
        };
        for uid in &to_query {
            self.cache
                .insert(&lookup.key(uid), &matching(&found, lookup.tag(), uid));
        }
        results.extend(found);
        Ok(results)
    }

    fn move_batch(&self, batch: &StudyBatch, destination: &str) -> Result<()> {
        let identifier = query::move_identifier(&batch.study_uid, &batch.series_uids);
        let id = self.next_context_id();
        let context = self.context(id, MOVE, None);
        let release_mode = self.options.get_move_release_mode();
        self.with_association(vec![context], release_mode, |association| {
            let Some(pc) = accepted(association, id, MOVE) else {
                return Ok(());
            };
            info!(
                "C-MOVE of {} series of study {} from {} @ {} to {}",
                batch.series_uids.len(),
                batch.study_uid,
                self.options.get_called_ae_title(),
                self.options.address(),
                destination
            );
            let destination = destination.to_string();
            let responses = association
                .invoke(move |message_id| {
                    DimseMessage::outbound(
                        pc,
                        command::move_rq(message_id, MOVE, Priority::High, &destination),
                        Some(identifier),
                        None,
                    )
                })
                .context(DispatchSnafu)?
                .wait()
                .context(DispatchSnafu)?;
            match responses.status_kind() {
                StatusKind::Failure => warn!(
                    "C-MOVE failed with status {:04X}",
                    responses.status().unwrap_or_default()
                ),
                _ => info!("Finished C-MOVE"),
            }
            Ok(())
        })
    }

    /// Send the instance in a DICOM file with C-STORE.
    ///
    /// Returns whether the peer stored it.
    pub fn store_file(&self, path: impl AsRef<Path>) -> Result<bool> {
        let (dataset, transfer_syntax) = store::read_file(path.as_ref()).context(StoreSnafu)?;
        self.store(dataset, Some(&transfer_syntax))
    }

    /// Send an instance with C-STORE.
    ///
    /// `transfer_syntax` is the one the data set was read in,
    /// used unless the data set declares its own.
    /// Returns whether the peer stored it.
    pub fn store(&self, dataset: InMemDicomObject, transfer_syntax: Option<&str>) -> Result<bool> {
        let StoreParams {
            sop_class_uid,
            sop_instance_uid,
            transfer_syntax,
        } = StoreParams::of(&dataset, transfer_syntax);
        let (Some(sop_class_uid), Some(sop_instance_uid)) = (sop_class_uid, sop_instance_uid)
        else {
            error!("Cannot store an instance without SOP class and instance UID");
            return Ok(false);
        };
        let source = StoreSource::new(dataset, &transfer_syntax).context(StoreSnafu)?;

        let id = self.next_context_id();
        let context = propose_context(id, sop_class_uid.as_str(), [transfer_syntax.as_str()], None);
        self.with_association(vec![context], ReleaseMode::Graceful, |association| {
            let Some(pc) = accepted(association, id, &sop_class_uid) else {
                return Ok(false);
            };
            info!("C-STORE of instance {}", sop_instance_uid);
            let responses = association
                .invoke(move |message_id| {
                    DimseMessage::outbound(
                        pc,
                        command::store_rq(
                            message_id,
                            &sop_class_uid,
                            &sop_instance_uid,
                            Priority::High,
                        ),
                        None,
                        Some(Box::new(source) as Box<dyn DataSource>),
                    )
                })
                .context(DispatchSnafu)?
                .wait()
                .context(DispatchSnafu)?;
            let success = responses.is_success();
            if !success {
                warn!("C-STORE failed with status {:04X}", responses.status().unwrap_or_default());
            }
            Ok(success)
        })
    }

    /// Cancel the operation in progress on the most recent association.
    ///
    /// The C-CANCEL is sent on an association of its own.
    /// Both associations are released afterwards;
    /// the cancelled operation still returns on its own.
    /// Returns whether a cancel request was sent.
    pub fn cancel(&self) -> Result<bool> {
        let Some(target) = lock(&self.active).clone() else {
            warn!("No operation to cancel");
            return Ok(false);
        };
        let message_id = target.current_message_id();
        let id = self.next_context_id();
        let (_guard, request) = self.propose(vec![self.context(id, FIND, None)])?;
        let association = self.open(&request)?;

        let outcome = match accepted(&association, id, FIND) {
            Some(pc) => {
                info!("C-CANCEL of message #{}", message_id);
                association
                    .send(move |_| DimseMessage::command_only(pc, command::cancel_rq(message_id)))
                    .map(|_| true)
                    .context(DispatchSnafu)
            }
            None => Ok(false),
        };
        if let Err(e) = association.release(ReleaseMode::Graceful) {
            warn!("Could not release cancel association: {}", e);
        }
        if let Err(e) = target.write_release_request() {
            warn!("Could not release cancelled association: {}", e);
        }
        outcome
    }

    /// Run a C-FIND, returning the matches.
    fn find(&self, query: InMemDicomObject) -> Result<Vec<InMemDicomObject>> {
        let id = self.next_context_id();
        let context = self.context(id, FIND, None);
        self.with_association(vec![context], ReleaseMode::Graceful, |association| {
            let Some(pc) = accepted(association, id, FIND) else {
                return Ok(Vec::new());
            };
            info!(
                "{} sending C-FIND request to {} @ {}",
                self.options.get_calling_ae_title(),
                self.options.get_called_ae_title(),
                self.options.address()
            );
            let responses = association
                .invoke(move |message_id| {
                    DimseMessage::outbound(
                        pc,
                        command::find_rq(message_id, FIND, Priority::High),
                        Some(query),
                        None,
                    )
                })
                .context(DispatchSnafu)?
                .wait()
                .context(DispatchSnafu)?;
            Ok(identifiers(responses, "C-FIND"))
        })
    }

    fn next_context_id(&self) -> u8 {
        let mut next = lock(&self.next_context_id);
        let id = *next;
        // odd ids only
        *next = next.wrapping_add(2);
        id
    }

    fn context(&self, id: u8, abstract_syntax: &str, role: Option<RoleSelection>) -> ProposedContext {
        propose_context(id, abstract_syntax, self.options.get_transfer_syntaxes(), role)
    }

    /// Add contexts to the template,
    /// returning a snapshot of the request to send.
    fn propose(
        &self,
        contexts: Vec<ProposedContext>,
    ) -> Result<(ContextGuard<'_>, AssociationRequest)> {
        let mut request = lock(&self.request);
        let mut ids = Vec::with_capacity(contexts.len());
        for context in contexts {
            let id = context.id;
            if let Err(source) = request.add_context(context) {
                for id in ids {
                    request.remove_context(id);
                }
                return Err(Error::Association { source });
            }
            ids.push(id);
        }
        let snapshot = request.clone();
        drop(request);
        Ok((
            ContextGuard {
                request: &self.request,
                ids,
            },
            snapshot,
        ))
    }

    fn open(&self, request: &AssociationRequest) -> Result<ActiveAssociation> {
        debug!(
            "Requesting association {} -> {} @ {}",
            request.calling_ae_title,
            request.called_ae_title,
            self.options.address()
        );
        let association = self
            .connector
            .connect(request, self.options.get_connect_timeout())
            .context(AssociationSnafu)?;
        ActiveAssociation::start(
            association,
            self.options.get_poll_interval(),
            self.options.get_response_timeout(),
        )
        .context(DispatchSnafu)
    }

    /// Run an operation on an association of its own.
    ///
    /// The association is released with the given mode afterwards,
    /// and the contexts are withdrawn from the template.
    /// A peer accepting none of the contexts yields the default value.
    fn with_association<T, F>(
        &self,
        contexts: Vec<ProposedContext>,
        release_mode: ReleaseMode,
        operation: F,
    ) -> Result<T>
    where
        T: Default,
        F: FnOnce(&ActiveAssociation) -> Result<T>,
    {
        let abstract_syntax = contexts
            .first()
            .map(|c| c.abstract_syntax.clone())
            .unwrap_or_default();
        let (_guard, request) = self.propose(contexts)?;
        let association = match self.open(&request) {
            Ok(association) => Arc::new(association),
            Err(Error::Association {
                source: association::Error::NoAcceptedPresentationContexts { .. },
            }) => {
                error!(
                    "SOP class {} not supported by {}",
                    abstract_syntax,
                    self.options.get_called_ae_title()
                );
                return Ok(T::default());
            }
            Err(e) => return Err(e),
        };
        *lock(&self.active) = Some(Arc::clone(&association));

        let outcome = operation(&*association);

        if let Err(e) = association.release(release_mode) {
            warn!("Could not release association: {}", e);
        }
        let mut active = lock(&self.active);
        if active
            .as_ref()
            .is_some_and(|a| Arc::ptr_eq(a, &association))
        {
            *active = None;
        }
        outcome
    }
}

/// How series are looked up for a C-MOVE.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SeriesLookup {
    ByStudy,
    BySeries,
}

impl SeriesLookup {
    fn key(self, uid: &str) -> CacheKey<'_> {
        match self {
            SeriesLookup::ByStudy => CacheKey::SeriesOfStudy(uid),
            SeriesLookup::BySeries => CacheKey::Series(uid),
        }
    }

    fn tag(self) -> dicom_core::Tag {
        match self {
            SeriesLookup::ByStudy => tags::STUDY_INSTANCE_UID,
            SeriesLookup::BySeries => tags::SERIES_INSTANCE_UID,
        }
    }
}

/// The id of the accepted context proposed with the given id.
fn accepted(association: &ActiveAssociation, id: u8, abstract_syntax: &str) -> Option<u8> {
    let pc = association.accepted_context_by_id(id).map(|pc| pc.id);
    if pc.is_none() {
        error!("SOP class {} not supported", abstract_syntax);
    }
    pc
}

/// The identifiers of the pending responses of an exchange,
/// none if the exchange failed.
fn identifiers(responses: Responses, operation: &str) -> Vec<InMemDicomObject> {
    if responses.status_kind() == StatusKind::Failure {
        warn!(
            "{} failed with status {:04X}",
            operation,
            responses.status().unwrap_or_default()
        );
        return Vec::new();
    }
    responses
        .pending
        .into_iter()
        .filter_map(|mut message| match message.take_dataset() {
            Ok(dataset) => dataset,
            Err(e) => {
                warn!("Could not decode {} response identifier: {}", operation, e);
                None
            }
        })
        .collect()
}

fn matching(
    datasets: &[InMemDicomObject],
    tag: dicom_core::Tag,
    uid: &str,
) -> Vec<InMemDicomObject> {
    datasets
        .iter()
        .filter(|dataset| uid_of(dataset, tag).as_deref() == Some(uid))
        .cloned()
        .collect()
}
