//! Deterministic offline backend.
//!
//! Embeddings are hashed character trigrams (plus whole words) folded into a
//! fixed-size vector and L2-normalised, so texts sharing vocabulary land close
//! together under cosine similarity. Generation is extractive: the reply is
//! built from the content block at the end of the prompt and shaped as the
//! JSON object the enrichment prompts ask for.
//!
//! Same input, same output, on every machine. Used for credential-free runs
//! and throughout the test suite.

use super::{BackendError, Generation, GenerationRequest, ModelBackend};
use async_trait::async_trait;

/// Output dimension of the hashed embeddings.
pub const LOCAL_EMBEDDING_DIMENSIONS: usize = 384;

pub struct LocalBackend {
    model: String,
    dimensions: usize,
}

impl LocalBackend {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            dimensions: LOCAL_EMBEDDING_DIMENSIONS,
        }
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions.max(8);
        self
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let lower = text.to_lowercase();

        let chars: Vec<char> = format!("  {lower}  ").chars().collect();
        for window in chars.windows(3) {
            let gram: String = window.iter().collect();
            add_feature(&mut vector, &gram, 1.0);
        }
        for word in lower.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            add_feature(&mut vector, word, 2.0);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn add_feature(vector: &mut [f32], feature: &str, weight: f32) {
    let hash = fnv1a(feature.as_bytes());
    let slot = (hash % vector.len() as u64) as usize;
    // top bit picks the sign so collisions tend to cancel
    let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
    vector[slot] += sign * weight;
}

#[async_trait]
impl ModelBackend for LocalBackend {
    fn name(&self) -> String {
        format!("local/{}", self.model)
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, BackendError> {
        let content = request
            .prompt
            .rsplit("\n\n")
            .find(|block| !block.trim().is_empty())
            .unwrap_or("")
            .trim();

        let (title, summary) = if request.image.is_some() {
            let context = content
                .strip_prefix("Context:")
                .map(str::trim)
                .filter(|c| !c.is_empty() && *c != "none");
            let description = match context {
                Some(c) => format!("Figure shown with: {}", first_sentences(c, 1)),
                None => "Figure without extractable text.".to_string(),
            };
            ("Figure".to_string(), description)
        } else if content.lines().any(|l| l.trim_start().starts_with('|')) {
            summarise_table(content)
        } else {
            let title = content.lines().next().unwrap_or("Untitled").trim().to_string();
            (title, first_sentences(content, 2))
        };

        let key = if request.image.is_some() { "description" } else { "summary" };
        let mut reply = serde_json::Map::new();
        reply.insert("title".into(), title.into());
        reply.insert(key.into(), summary.into());
        let text = serde_json::Value::Object(reply).to_string();
        Ok(Generation {
            input_tokens: request.prompt.split_whitespace().count(),
            output_tokens: text.split_whitespace().count(),
            text,
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        texts
            .iter()
            .map(|t| {
                if t.trim().is_empty() {
                    Err(BackendError::Rejected("empty input".into()))
                } else {
                    Ok(self.embed_one(t))
                }
            })
            .collect()
    }

    fn max_batch_size(&self) -> usize {
        256
    }
}

fn split_row(line: &str) -> Vec<String> {
    line.trim()
        .trim_matches('|')
        .split('|')
        .map(|c| c.trim().to_string())
        .collect()
}

fn summarise_table(content: &str) -> (String, String) {
    let title = content
        .lines()
        .find_map(|l| l.trim().strip_prefix("## "))
        .unwrap_or("Table")
        .trim()
        .to_string();
    let rows: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('|'))
        .filter(|l| !l.chars().all(|c| matches!(c, '|' | '-' | ':' | ' ')))
        .collect();
    let header = rows.first().map(|r| split_row(r)).unwrap_or_default();
    let data_rows = rows.len().saturating_sub(1);
    let columns = header
        .iter()
        .filter(|h| !h.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    (
        title,
        format!("Table with {data_rows} rows covering {columns}."),
    )
}

fn first_sentences(text: &str, n: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut out = String::new();
    let mut count = 0;
    for (i, ch) in flat.char_indices() {
        if matches!(ch, '.' | '!' | '?') {
            let next = flat[i + ch.len_utf8()..].chars().next();
            if next.is_none() || next == Some(' ') {
                count += 1;
                if count == n {
                    out = flat[..i + ch.len_utf8()].to_string();
                    break;
                }
            }
        }
    }
    if out.is_empty() {
        flat
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn embeddings_are_deterministic_and_normalised() {
        let backend = LocalBackend::new("char-ngram-384");
        let a = backend.embed_one("Hospital cash benefit per day");
        let b = backend.embed_one("Hospital cash benefit per day");
        assert_eq!(a, b);
        assert_eq!(a.len(), LOCAL_EMBEDDING_DIMENSIONS);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn similar_texts_score_higher() {
        let backend = LocalBackend::new("m");
        let q = backend.embed_one("deductible for hospital stays");
        let near = backend.embed_one("The deductible for hospital stays is $1,500.");
        let far = backend.embed_one("Premiums are payable annually by GIRO.");
        assert!(cosine(&q, &near) > cosine(&q, &far));
    }

    #[tokio::test]
    async fn rejects_empty_text() {
        let backend = LocalBackend::new("m");
        let err = backend.embed(&["ok".into(), "  ".into()]).await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }

    #[tokio::test]
    async fn generation_summarises_markdown_table() {
        let backend = LocalBackend::new("extractive");
        let request = GenerationRequest {
            system: "sys".into(),
            prompt: "Describe this table.\n\n## Plan limits\n| Plan | Limit |\n|---|---|\n| A | $100 |\n| B | $200 |"
                .into(),
            image: None,
            temperature: 0.0,
            max_tokens: 64,
        };
        let out = backend.generate(&request).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&out.text).unwrap();
        assert_eq!(value["title"], "Plan limits");
        assert_eq!(value["summary"], "Table with 2 rows covering Plan, Limit.");
    }

    #[test]
    fn first_sentences_stops_at_boundary() {
        assert_eq!(first_sentences("One. Two! Three?", 2), "One. Two!");
        assert_eq!(first_sentences("no terminal punctuation", 2), "no terminal punctuation");
    }
}
