use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stage names a principal starts with, in display order.
pub const DEFAULT_STAGES: [&str; 5] = ["Saved", "Applied", "Interviewing", "Offer", "Rejected"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Resume,
    CoverLetter,
    Portfolio,
    Reference,
    #[serde(other)]
    Other,
}

impl DocumentKind {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().replace('-', "_").as_str() {
            "resume" => DocumentKind::Resume,
            "cover_letter" | "coverletter" => DocumentKind::CoverLetter,
            "portfolio" => DocumentKind::Portfolio,
            "reference" => DocumentKind::Reference,
            _ => DocumentKind::Other,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DocumentKind::Resume => "resume",
            DocumentKind::CoverLetter => "cover_letter",
            DocumentKind::Portfolio => "portfolio",
            DocumentKind::Reference => "reference",
            DocumentKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDocument {
    pub id: String,
    pub name: String,
    pub completed: bool,
    #[serde(rename = "type")]
    pub kind: DocumentKind,
}

impl JobDocument {
    pub fn new(name: &str, kind: DocumentKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            completed: false,
            kind,
        }
    }

    /// Checklist attached to a job when the caller supplies none.
    pub fn default_checklist() -> Vec<JobDocument> {
        vec![
            JobDocument::new("Resume", DocumentKind::Resume),
            JobDocument::new("Cover Letter", DocumentKind::CoverLetter),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "userId")]
    pub owner_id: String,
    pub company: String,
    pub title: String,
    pub status: String,
    pub date_added: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    // Older records predate checklists.
    #[serde(default)]
    pub documents: Vec<JobDocument>,
}

/// A job as handed in by a collaborator, before the store assigns id,
/// owner and timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub company: String,
    pub title: String,
    pub status: String,
    pub description: String,
    pub link: Option<String>,
    pub notes: Option<String>,
    pub documents: Vec<JobDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageCount {
    pub stage: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub total: usize,
    pub by_stage: Vec<StageCount>,
}

// `byStage` goes out as a stage-name map in stage order.
impl Serialize for Stats {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        struct ByStage<'a>(&'a [StageCount]);

        impl Serialize for ByStage<'_> {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                use serde::ser::SerializeMap;
                let mut map = serializer.serialize_map(Some(self.0.len()))?;
                for entry in self.0 {
                    map.serialize_entry(&entry.stage, &entry.count)?;
                }
                map.end()
            }
        }

        let mut state = serializer.serialize_struct("Stats", 2)?;
        state.serialize_field("total", &self.total)?;
        state.serialize_field("byStage", &ByStage(&self.by_stage))?;
        state.end()
    }
}

impl Stats {
    pub fn count(&self, stage: &str) -> Option<usize> {
        self.by_stage
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.count)
    }

    /// Jobs whose status matches no known stage.
    pub fn unstaged(&self) -> usize {
        self.total
            .saturating_sub(self.by_stage.iter().map(|s| s.count).sum::<usize>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_deserializes_without_documents() {
        let raw = r#"{
            "id": "j1",
            "userId": "u1",
            "company": "Acme",
            "title": "SWE",
            "status": "Saved",
            "dateAdded": "2024-03-01T10:00:00Z",
            "description": ""
        }"#;
        let job: Job = serde_json::from_str(raw).unwrap();
        assert!(job.documents.is_empty());
        assert_eq!(job.owner_id, "u1");
        assert!(job.link.is_none());
    }

    #[test]
    fn test_job_serializes_wire_field_names() {
        let job = Job {
            id: "j1".to_string(),
            owner_id: "u1".to_string(),
            company: "Acme".to_string(),
            title: "SWE".to_string(),
            status: "Saved".to_string(),
            date_added: "2024-03-01T10:00:00Z".parse().unwrap(),
            description: String::new(),
            link: None,
            notes: Some("referral".to_string()),
            documents: vec![JobDocument {
                id: "d1".to_string(),
                name: "Cover Letter".to_string(),
                completed: true,
                kind: DocumentKind::CoverLetter,
            }],
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["dateAdded"], "2024-03-01T10:00:00Z");
        assert_eq!(value["documents"][0]["type"], "cover_letter");
        assert!(value.get("link").is_none());
    }

    #[test]
    fn test_unknown_document_kind_reads_as_other() {
        let doc: JobDocument =
            serde_json::from_str(r#"{"id":"d","name":"Transcript","completed":false,"type":"transcript"}"#)
                .unwrap();
        assert_eq!(doc.kind, DocumentKind::Other);
    }

    #[test]
    fn test_document_kind_parse() {
        assert_eq!(DocumentKind::parse("Cover-Letter"), DocumentKind::CoverLetter);
        assert_eq!(DocumentKind::parse("resume"), DocumentKind::Resume);
        assert_eq!(DocumentKind::parse("misc"), DocumentKind::Other);
    }

    #[test]
    fn test_default_checklist() {
        let docs = JobDocument::default_checklist();
        assert_eq!(docs.len(), 2);
        assert_ne!(docs[0].id, docs[1].id);
        assert!(docs.iter().all(|d| !d.completed));
    }

    fn stats(total: usize, counts: &[(&str, usize)]) -> Stats {
        Stats {
            total,
            by_stage: counts
                .iter()
                .map(|(stage, count)| StageCount {
                    stage: stage.to_string(),
                    count: *count,
                })
                .collect(),
        }
    }

    #[test]
    fn test_stats_json_maps_stage_to_count_in_order() {
        let stats = stats(3, &[("Saved", 1), ("Applied", 0), ("Offer", 2)]);
        assert_eq!(
            serde_json::to_string(&stats).unwrap(),
            r#"{"total":3,"byStage":{"Saved":1,"Applied":0,"Offer":2}}"#
        );
    }

    #[test]
    fn test_unstaged_never_underflows() {
        assert_eq!(stats(3, &[("Saved", 1)]).unstaged(), 2);
        assert_eq!(stats(1, &[("Offer", 1), ("Offer", 1)]).unstaged(), 0);
    }
}
