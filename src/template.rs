//! # Context assembly and the prompt template
//!
//! Retrieved fragments become the model's grounding context here:
//!
//! 1. [`assemble`] joins the ranked chunk texts with [`CONTEXT_SEPARATOR`]
//!    (a blank line), keeping rank order.
//! 2. [`assemble_prompt`] places that context and the user's query into a
//!    fixed instruction template.
//!
//! The template wording is part of the contract with the model. It tells the
//! model to answer from the context only, to say so when the context has no
//! answer, and to put each point of a multi-point answer on its own line.
//! Tests compare the rendered prompt as text, so changes to the wording are
//! deliberate and visible.
//!
//! ```rust
//! use awful_rag::template::{assemble, assemble_prompt};
//!
//! let context = assemble(["Rust is a systems language.", "It has no GC."]);
//! let prompt = assemble_prompt(&context, "Does Rust have a GC?");
//! assert!(prompt.contains("Context:\nRust is a systems language.\n\nIt has no GC."));
//! assert!(prompt.ends_with("Query: Does Rust have a GC?"));
//! ```

/// Separator placed between fragments in the grounding context.
pub const CONTEXT_SEPARATOR: &str = "\n\n";

/// Fixed reply the model is told to give when the context has no answer.
pub const NOT_IN_CONTEXT_REPLY: &str = "The context does not contain information about this.";

/// Join ranked chunk texts into one grounding block.
pub fn assemble<I, S>(chunks: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut context = String::new();
    for (i, chunk) in chunks.into_iter().enumerate() {
        if i > 0 {
            context.push_str(CONTEXT_SEPARATOR);
        }
        context.push_str(chunk.as_ref());
    }
    context
}

/// Render the instruction template around `context` and `query`.
pub fn assemble_prompt(context: &str, query: &str) -> String {
    format!(
        "You are an assistant who answers questions only using the provided context.\n\
         Do not make up or assume information. If the answer is not in the context, reply with:\n\
         '{NOT_IN_CONTEXT_REPLY}'\n\
         If the answer has several points, put each point on its own line.\n\n\
         Context:\n{context}\n\n\
         Query: {query}"
    )
}
