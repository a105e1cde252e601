use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// One curatable headline. Ids are dense and 0-based within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub id: usize,
    pub title: String,
    pub link: Url,
    #[serde(default)]
    pub description: String,
    pub published_at: DateTime<Utc>,
}

impl Candidate {
    /// Line sent to selection models: `"<id>: <title>"`
    pub fn prompt_line(&self) -> String {
        format!("{}: {}", self.id, flatten(&self.title))
    }

    /// Tab-separated line sent to the clustering model
    pub fn cluster_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}",
            self.id,
            flatten(&self.title),
            self.link,
            flatten(&self.description)
        )
    }

    pub fn is_bangla(&self) -> bool {
        is_bangla(&self.title)
    }
}

impl AsRef<Candidate> for Candidate {
    fn as_ref(&self) -> &Candidate {
        self
    }
}

/// True when the text contains at least one character of the Bengali block.
pub fn is_bangla(text: &str) -> bool {
    text.chars().any(|c| ('\u{0980}'..='\u{09FF}').contains(&c))
}

fn flatten(s: &str) -> String {
    s.replace(['\n', '\r', '\t'], " ").trim().to_string()
}

/// Reassign ids so they are dense and match list positions.
pub fn renumber(candidates: &mut [Candidate]) {
    for (i, c) in candidates.iter_mut().enumerate() {
        c.id = i;
    }
}

#[cfg(test)]
pub(crate) fn sample(id: usize, title: &str, description: &str) -> Candidate {
    Candidate {
        id,
        title: title.to_string(),
        link: Url::parse(&format!("https://news.example.com/{}", id)).unwrap(),
        description: description.to_string(),
        published_at: Utc::now(),
    }
}
