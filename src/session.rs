//! The protocol session: one transport connection, serialized operations,
//! lazy reconnection and cooperative cancellation.
//!
//! A [`Session`] owns at most one live transport handle. Operations are
//! strictly serialized on a single async slot; callers that need
//! concurrency use independent sessions, never multiplex one transport.
//! A failure of the transient network class (connection dropped, service
//! unavailable, resource exhaustion) is answered with exactly one
//! reconnect-bind-retry cycle before the error surfaces; all other failures
//! surface immediately. Cancellation interrupts the in-flight call, tears
//! the transport down (gracefully within a bounded grace period, forcibly
//! by dropping the handle otherwise) and leaves the session disconnected.

use std::sync::{
	atomic::{AtomicU8, Ordering},
	Arc,
};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
	config::ConnectionConfig,
	credentials::CredentialSource,
	dn::{Dn, Rdn},
	entry::AttributeValue,
	error::{Error, OperationKind},
	provider::{DirectoryProvider, ModifyOp, ProviderHandle},
	search::{RecordStream, SearchRequest},
};

/// How long a cancelled or closed handle gets for a graceful shutdown
/// before it is dropped outright.
const TEARDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

/// The connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
	/// No transport handle exists.
	Disconnected = 0,
	/// The transport connection (including TLS) is being established.
	Connecting = 1,
	/// Connected but not yet authenticated.
	Connected = 2,
	/// Authentication is in flight.
	Binding = 3,
	/// Ready for operations.
	Bound = 4,
}

/// Shared, atomically updated session state, observable without taking the
/// operation slot.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
	/// A cell starting out disconnected.
	fn new() -> Self {
		StateCell(AtomicU8::new(SessionState::Disconnected as u8))
	}

	/// The current state.
	pub(crate) fn get(&self) -> SessionState {
		match self.0.load(Ordering::Acquire) {
			1 => SessionState::Connecting,
			2 => SessionState::Connected,
			3 => SessionState::Binding,
			4 => SessionState::Bound,
			_ => SessionState::Disconnected,
		}
	}

	/// Publishes a new state.
	pub(crate) fn set(&self, state: SessionState) {
		self.0.store(state as u8, Ordering::Release);
	}
}

/// The operation slot: the optional live handle behind the session's single
/// async mutex.
pub(crate) type Slot = Arc<Mutex<Option<Box<dyn ProviderHandle>>>>;

/// One protocol session against one directory server.
#[derive(Debug)]
pub struct Session {
	/// Connection parameters, kept across reconnects and `close`.
	config: ConnectionConfig,
	/// Factory for transport handles.
	provider: Arc<dyn DirectoryProvider>,
	/// Supplies bind credentials, once per bind attempt.
	credentials: Arc<dyn CredentialSource>,
	/// The single operation slot.
	slot: Slot,
	/// Observable connection state.
	state: Arc<StateCell>,
}

impl Session {
	/// Creates a disconnected session. The first operation connects lazily.
	#[must_use]
	pub fn new(
		config: ConnectionConfig,
		provider: Arc<dyn DirectoryProvider>,
		credentials: Arc<dyn CredentialSource>,
	) -> Self {
		Session {
			config,
			provider,
			credentials,
			slot: Arc::new(Mutex::new(None)),
			state: Arc::new(StateCell::new()),
		}
	}

	/// The connection parameters.
	#[must_use]
	pub fn config(&self) -> &ConnectionConfig {
		&self.config
	}

	/// The current connection state.
	#[must_use]
	pub fn state(&self) -> SessionState {
		self.state.get()
	}

	/// Drops the transport handle after a graceful shutdown attempt. The
	/// connection parameters stay usable for reopening.
	pub async fn close(&self) {
		let mut slot = self.slot.lock().await;
		teardown(&mut slot, &self.state).await;
	}

	/// Issues a search. The returned stream keeps the operation slot until
	/// it is finished or dropped; results arrive lazily as it is consumed.
	pub async fn search(
		&self,
		request: &SearchRequest,
		cancel: &CancellationToken,
	) -> Result<RecordStream, Error> {
		let mut guard = self.lock_slot(cancel).await?;
		self.ensure_bound(&mut guard, cancel).await?;
		let mut retried = false;
		loop {
			let handle = match guard.as_mut() {
				Some(handle) => handle,
				None => return Err(no_connection(&self.config)),
			};
			match supervise(cancel, handle.search(request)).await {
				Ok(cursor) => {
					return Ok(RecordStream::new(
						guard,
						cursor,
						cancel.clone(),
						Arc::clone(&self.state),
						request.referrals,
					))
				}
				Err(err) if err.is_transient() && !retried => {
					retried = true;
					self.recover(&mut guard, cancel, OperationKind::Search, &err).await?;
				}
				Err(Error::Cancelled) => {
					teardown(&mut guard, &self.state).await;
					return Err(Error::Cancelled);
				}
				Err(err) => return Err(err),
			}
		}
	}

	/// Adds an entry.
	pub async fn add(
		&self,
		dn: &Dn,
		attributes: &[(String, Vec<AttributeValue>)],
		cancel: &CancellationToken,
	) -> Result<(), Error> {
		self.execute_write(WriteOp::Add { dn, attributes }, cancel).await
	}

	/// Applies attribute modifications to an entry.
	pub async fn modify(
		&self,
		dn: &Dn,
		changes: &[ModifyOp],
		cancel: &CancellationToken,
	) -> Result<(), Error> {
		self.execute_write(WriteOp::Modify { dn, changes }, cancel).await
	}

	/// Renames an entry below the same parent.
	pub async fn rename(
		&self,
		dn: &Dn,
		new_rdn: &Rdn,
		delete_old_rdn: bool,
		cancel: &CancellationToken,
	) -> Result<(), Error> {
		self.execute_write(WriteOp::Rename { dn, new_rdn, delete_old_rdn }, cancel).await
	}

	/// Deletes a leaf entry.
	pub async fn delete(&self, dn: &Dn, cancel: &CancellationToken) -> Result<(), Error> {
		self.execute_write(WriteOp::Delete { dn }, cancel).await
	}

	/// Runs one write operation under the retry and cancellation contract.
	async fn execute_write(
		&self,
		op: WriteOp<'_>,
		cancel: &CancellationToken,
	) -> Result<(), Error> {
		let mut guard = self.lock_slot(cancel).await?;
		self.ensure_bound(&mut guard, cancel).await?;
		let mut retried = false;
		loop {
			let handle = match guard.as_mut() {
				Some(handle) => handle,
				None => return Err(no_connection(&self.config)),
			};
			match supervise(cancel, op.apply(handle.as_mut())).await {
				Err(err) if err.is_transient() && !retried => {
					retried = true;
					self.recover(&mut guard, cancel, op.kind(), &err).await?;
				}
				Err(Error::Cancelled) => {
					teardown(&mut guard, &self.state).await;
					return Err(Error::Cancelled);
				}
				other => return other,
			}
		}
	}

	/// Takes the operation slot, or reports cancellation while waiting.
	pub(crate) async fn lock_slot(
		&self,
		cancel: &CancellationToken,
	) -> Result<OwnedMutexGuard<Option<Box<dyn ProviderHandle>>>, Error> {
		tokio::select! {
			biased;
			() = cancel.cancelled() => Err(Error::Cancelled),
			guard = Arc::clone(&self.slot).lock_owned() => Ok(guard),
		}
	}

	/// Connects and binds if no live handle exists.
	pub(crate) async fn ensure_bound(
		&self,
		slot: &mut Option<Box<dyn ProviderHandle>>,
		cancel: &CancellationToken,
	) -> Result<(), Error> {
		if slot.is_none() {
			self.establish(slot, cancel).await?;
		}
		Ok(())
	}

	/// The one-shot recovery cycle after a transient failure: tear down,
	/// reconnect, rebind. The retried operation is re-issued by the caller.
	async fn recover(
		&self,
		slot: &mut Option<Box<dyn ProviderHandle>>,
		cancel: &CancellationToken,
		op: OperationKind,
		cause: &Error,
	) -> Result<(), Error> {
		warn!("reconnecting after transient failure during {op}: {cause}");
		teardown(slot, &self.state).await;
		self.establish(slot, cancel).await
	}

	/// Connects, negotiates TLS (inside the provider) and binds, advancing
	/// the state machine. On any failure the session ends up disconnected.
	async fn establish(
		&self,
		slot: &mut Option<Box<dyn ProviderHandle>>,
		cancel: &CancellationToken,
	) -> Result<(), Error> {
		self.state.set(SessionState::Connecting);
		let mut handle = match supervise(cancel, self.provider.connect(&self.config)).await {
			Ok(handle) => handle,
			Err(err) => {
				self.state.set(SessionState::Disconnected);
				return Err(err);
			}
		};
		self.state.set(SessionState::Connected);
		debug!("connected to {}", self.config.url);

		self.state.set(SessionState::Binding);
		let result = supervise(cancel, async {
			let credentials = self.credentials.credentials().await?;
			handle.bind(&credentials).await
		})
		.await;
		match result {
			Ok(()) => {
				self.state.set(SessionState::Bound);
				debug!("bound as {:?}", self.config.bind_principal);
				*slot = Some(handle);
				Ok(())
			}
			Err(err) => {
				let mut dropped = Some(handle);
				teardown(&mut dropped, &self.state).await;
				Err(err)
			}
		}
	}
}

/// One pending write operation, borrowed from the caller so a transient
/// failure can re-issue it unchanged.
enum WriteOp<'a> {
	/// An entry addition.
	Add {
		/// Target DN.
		dn: &'a Dn,
		/// Initial attributes.
		attributes: &'a [(String, Vec<AttributeValue>)],
	},
	/// An attribute modification.
	Modify {
		/// Target DN.
		dn: &'a Dn,
		/// The changes to apply.
		changes: &'a [ModifyOp],
	},
	/// A rename below the same parent.
	Rename {
		/// Target DN.
		dn: &'a Dn,
		/// The new naming component.
		new_rdn: &'a Rdn,
		/// Whether the old RDN attribute value is removed from the entry.
		delete_old_rdn: bool,
	},
	/// An entry deletion.
	Delete {
		/// Target DN.
		dn: &'a Dn,
	},
}

impl WriteOp<'_> {
	/// The operation kind, for logging and error context.
	fn kind(&self) -> OperationKind {
		match self {
			WriteOp::Add { .. } => OperationKind::Create,
			WriteOp::Modify { .. } => OperationKind::Modify,
			WriteOp::Rename { .. } => OperationKind::Rename,
			WriteOp::Delete { .. } => OperationKind::Delete,
		}
	}

	/// Issues the operation on a handle.
	async fn apply(&self, handle: &mut dyn ProviderHandle) -> Result<(), Error> {
		match self {
			WriteOp::Add { dn, attributes } => handle.add(dn, attributes).await,
			WriteOp::Modify { dn, changes } => handle.modify(dn, changes).await,
			WriteOp::Rename { dn, new_rdn, delete_old_rdn } => {
				handle.rename(dn, new_rdn, *delete_old_rdn).await
			}
			WriteOp::Delete { dn } => handle.delete(dn).await,
		}
	}
}

/// Awaits a provider future, reporting cancellation as its own outcome. The
/// future is dropped on cancellation; transport cleanup is the caller's
/// responsibility.
async fn supervise<T>(
	cancel: &CancellationToken,
	fut: impl std::future::Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
	tokio::select! {
		biased;
		() = cancel.cancelled() => Err(Error::Cancelled),
		result = fut => result,
	}
}

/// Drops the slot's handle after a bounded graceful shutdown attempt and
/// publishes the disconnected state. A handle that does not shut down
/// within the grace period is dropped anyway, which force-closes the
/// transport. Never leaves a half-open handle behind.
pub(crate) async fn teardown(slot: &mut Option<Box<dyn ProviderHandle>>, state: &StateCell) {
	if let Some(mut handle) = slot.take() {
		match tokio::time::timeout(TEARDOWN_GRACE, handle.close()).await {
			Ok(Ok(())) => debug!("transport closed"),
			Ok(Err(err)) => debug!("transport close reported: {err}"),
			Err(_) => warn!("transport close timed out, dropping the handle"),
		}
	}
	state.set(SessionState::Disconnected);
}

/// The error reported when an operation finds no live handle where one was
/// just established.
fn no_connection(config: &ConnectionConfig) -> Error {
	Error::Connect { url: config.url.to_string(), reason: "no connection".to_owned() }
}
