//! Client for the remote bibliographic graph API.
//!
//! A [`TokenCache`] holds the client-credentials bearer token; the
//! [`GraphClient`] uses it to issue throttled, paginated queries and read the
//! total-match count from each response envelope.

mod client;
mod filters;
mod token;

pub use client::{Classification, DatasourceRecord, GraphClient, OrganizationRecord, Page};
pub use filters::{
    DATASOURCES_PATH, Filters, ORGANIZATIONS_PATH, PROJECTS_PATH, RESEARCH_PRODUCTS_PATH, Scope,
    extract_ror_id, normalise_ror_link,
};
pub use token::TokenCache;
