//! Context assembly for the completion prompt.
//!
//! Pure function from retrieved matches to a prompt block plus the
//! deduplicated source list shown to the client. No I/O, fully
//! deterministic: same matches in, same text out.

use crate::models::VectorMatch;

/// Heading placed above uploaded-document excerpts. Uploads outrank the
/// shared knowledge base when the two disagree.
const USER_DOCS_HEADER: &str =
    "Documents uploaded by the user (these take priority over general knowledge):";

const GENERAL_HEADER: &str = "Relevant knowledge base entries:";

/// Assembled prompt context and its citation list.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    pub context: String,
    pub sources: Vec<String>,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.context.is_empty()
    }
}

/// Render retrieved matches into the prompt context block.
///
/// Uploaded-document excerpts come first under a priority heading, then
/// general knowledge. Sources are listed once each, in first-seen order:
/// upload filenames as-is, general sources reduced to their basename.
pub fn assemble(general: &[VectorMatch], user_documents: &[VectorMatch]) -> AssembledContext {
    let mut sections = Vec::new();
    let mut sources = Vec::new();

    if !user_documents.is_empty() {
        let mut block = String::from(USER_DOCS_HEADER);
        for m in user_documents {
            block.push_str("\n\n");
            block.push_str(&format!(
                "User Document ({}): {}",
                m.metadata.source, m.metadata.text
            ));
            push_unique(&mut sources, m.metadata.source.clone());
        }
        sections.push(block);
    }

    if !general.is_empty() {
        let mut block = String::from(GENERAL_HEADER);
        for m in general {
            block.push_str("\n\n");
            block.push_str(&format!(
                "Content: {}\nSource: {}",
                m.metadata.text, m.metadata.source
            ));
            push_unique(&mut sources, basename(&m.metadata.source).to_string());
        }
        sections.push(block);
    }

    AssembledContext {
        context: sections.join("\n\n"),
        sources,
    }
}

fn push_unique(sources: &mut Vec<String>, source: String) {
    if !sources.contains(&source) {
        sources.push(source);
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
