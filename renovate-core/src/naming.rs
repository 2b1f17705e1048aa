//! Logical workload names
//!
//! Names end up as DNS labels on the platform, which also appends a random
//! suffix of its own. Logical names are therefore kept within 52 characters.

use sha2::{Digest, Sha256};

use crate::domain::job::RenovateJobIdentifier;

/// Longest logical name handed to the platform
pub const MAX_NAME_LENGTH: usize = 52;

const HASH_LENGTH: usize = 8;

/// Logical name of the discovery probe of a job
pub fn discovery_job_name(job: &RenovateJobIdentifier) -> String {
    bounded_name(&format!("{}-{}-discovery", job.name, job.namespace))
}

/// Logical name of the execution workload of one project
pub fn executor_job_name(job: &RenovateJobIdentifier, project: &str) -> String {
    bounded_name(&format!("{}-{}", job.name, project))
}

/// Sanitises `raw` into a DNS label and truncates it with a hash suffix when too long
///
/// The hash is taken over the raw input so that distinct long names which
/// share a prefix stay distinct.
pub fn bounded_name(raw: &str) -> String {
    let sanitized = sanitize(raw);
    if sanitized.len() <= MAX_NAME_LENGTH {
        return sanitized;
    }

    let digest = hex::encode(Sha256::digest(raw.as_bytes()));
    let prefix_len = MAX_NAME_LENGTH - HASH_LENGTH - 1;
    let prefix = sanitized[..prefix_len].trim_end_matches('-');

    format!("{}-{}", prefix, &digest[..HASH_LENGTH])
}

fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;

    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }

    out.trim_matches('-').to_string()
}
