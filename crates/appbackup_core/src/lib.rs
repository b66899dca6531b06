//! # appbackup core
//!
//! Orchestrates application backup and restore between installed
//! applications' agents and a pluggable storage transport.
//!
//! This crate provides:
//! - An operation registry that reconciles agent completions, timeouts and
//!   cancellations per token
//! - A key-value backup pass and a full-data backup phase
//! - A restore session that handles key-value blobs and full-data archives
//! - A single-worker service that serializes passes and sessions
//!
//! The platform is reached only through traits: [`Transport`],
//! [`AgentHost`], [`BackupAgent`], [`PackageManager`] and [`SideChannel`].
//!
//! ## Driving a task by hand
//!
//! Every pass is a [`Task`]: a state machine stepped by events. The service
//! runs tasks on its worker, and [`drive_task`] runs one on the calling
//! thread:
//!
//! ```ignore
//! let mailbox = TaskMailbox::new();
//! let mut task = RestoreTask::new(ctx, mailbox.callback(), RestoreParams::new(token, observer));
//! drive_task(&mut task, &mailbox);
//! let result = task.take_result();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod agent;
mod bookkeeping;
mod config;
mod context;
mod error;
mod full_backup;
mod full_restore;
mod kv_backup;
mod observer;
mod package_manager;
mod pipe;
mod pm_agent;
mod registry;
mod restore;
mod service;
mod state_files;
mod status;
mod task;
mod transport;

pub use agent::{AgentBinding, AgentHost, BackupAgent, BindMode, FullBackupOutput, RestoreFileRequest};
pub use bookkeeping::{now_millis, Bookkeeping, FullBackupEntry, Journal};
pub use config::{ServiceConfig, Timeouts};
pub use context::{BackupContext, SideChannelDelta};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use full_backup::{full_backup_candidates, refresh_full_queue, FullBackupPhase, FullPassResult};
pub use full_restore::{FullRestoreEngine, RestoreSummary};
pub use kv_backup::{BackupState, KeyValueBackupTask, KeyValuePassResult};
pub use observer::{BackupObserver, NoopObserver, RestoreObserver};
pub use package_manager::{NoSideChannel, PackageManager, SideChannel};
pub use pipe::{pipe, PipeCloser, PipeReader, PipeWriter};
pub use pm_agent::{PackageMetadata, PmAgent, RestoreMetadata, META_KEY, PM_PACKAGE};
pub use registry::{Completion, Operation, OperationCallback, OperationKind, OperationRegistry, OperationState};
pub use restore::{RestoreParams, RestorePassResult, RestoreState, RestoreTask};
pub use service::BackupService;
pub use state_files::PackageFiles;
pub use status::{PackageOutcome, PassStatus, TransportStatus};
pub use task::{drive_task, Next, Task, TaskEvent, TaskMailbox};
pub use transport::{BackupFlags, DataType, FullRestoreChunk, NextPackage, RestoreDescriptor, Transport};
