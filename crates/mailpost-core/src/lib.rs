//! mailpost Core - SMTP ingestion pipeline
//!
//! This crate receives messages over SMTP, stages them, checks DKIM and SPF
//! through an external validator, normalizes the MIME content, guesses the
//! body language and posts the resulting envelope to a webhook.

pub mod auth;
pub mod language;
pub mod normalize;
pub mod pipeline;
pub mod smtp;
pub mod webhook;

pub use auth::{AuthSettings, AuthValidator, ScriptValidator};
pub use language::{LanguageDetector, LanguageGuess, WhatlangDetector};
pub use normalize::{MailNormalizer, NormalizedMail};
pub use pipeline::{Ack, Accepted, Orchestrator, PipelineReport, Session, SessionMeta};
pub use smtp::SmtpServer;
pub use webhook::{DeliveryOutcome, WebhookDispatcher};
