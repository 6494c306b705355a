//! Named topics connecting the stages.

use serde::{Deserialize, Serialize};

use crate::event::EventKind;

/// A fan-out topic. Each carries exactly one [`EventKind`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Upload completions → Submission.
    JobUploads,
    /// New jobs → Execution.
    JobRequests,
    /// Finished jobs → Notification.
    JobResults,
    /// Finished jobs → Archival.
    JobArchive,
    /// Subscription upgrades → Thaw.
    JobThaw,
    /// Cold-storage retrieval completions → Restoration.
    JobRestore,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::JobUploads,
        Topic::JobRequests,
        Topic::JobResults,
        Topic::JobArchive,
        Topic::JobThaw,
        Topic::JobRestore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::JobUploads => "job_uploads",
            Topic::JobRequests => "job_requests",
            Topic::JobResults => "job_results",
            Topic::JobArchive => "job_archive",
            Topic::JobThaw => "job_thaw",
            Topic::JobRestore => "job_restore",
        }
    }

    pub fn parse(s: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// The only event kind published on this topic.
    pub fn event_kind(&self) -> EventKind {
        match self {
            Topic::JobUploads => EventKind::UploadCompleted,
            Topic::JobRequests => EventKind::JobRequested,
            Topic::JobResults => EventKind::ResultsReady,
            Topic::JobArchive => EventKind::ArchiveCandidate,
            Topic::JobThaw => EventKind::UpgradeRequested,
            Topic::JobRestore => EventKind::RetrievalReady,
        }
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_every_topic() {
        for topic in Topic::ALL {
            assert_eq!(Topic::parse(topic.as_str()), Some(topic));
        }
        assert_eq!(Topic::parse("nope"), None);
    }
}
