//! Paragraph-boundary text chunker.
//!
//! Splits document text into [`Chunk`]s of at most `max_tokens` (estimated at
//! four characters per token). Paragraphs (`\n\n`) are kept whole when they
//! fit; longer ones are hard-split at whitespace. With `overlap_tokens > 0`,
//! each chunk starts with the tail of the previous one, cut at a word
//! boundary, so that a sentence straddling two chunks is searchable in both.
//!
//! Chunk ids are UUID v5 of the document id and chunk index, so re-ingesting
//! a document yields the same ids. Each chunk carries the SHA-256 of its text
//! for embedding staleness detection.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

const CHARS_PER_TOKEN: usize = 4;

pub fn chunk_text(
    document_id: &str,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = (overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);

    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();
    // whether `buf` holds text that has not been emitted yet
    let mut fresh = false;

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if para.len() > max_chars {
            if fresh {
                pieces.push(std::mem::take(&mut buf));
            }
            buf.clear();
            fresh = false;
            pieces.extend(hard_split(para, max_chars, overlap_chars));
            if let Some(last) = pieces.last() {
                buf = tail(last, overlap_chars).to_string();
            }
            continue;
        }

        let would_be = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };

        if would_be > max_chars {
            if fresh {
                let carried = tail(&buf, overlap_chars).to_string();
                pieces.push(std::mem::replace(&mut buf, carried));
                fresh = false;
            }
            // overlap is dropped when it would not leave room for the paragraph
            if !buf.is_empty() && buf.len() + 2 + para.len() > max_chars {
                buf.clear();
            }
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
        fresh = true;
    }

    if fresh {
        pieces.push(buf);
    }

    // Guarantee at least one chunk
    if pieces.is_empty() {
        pieces.push(text.trim().to_string());
    }

    pieces
        .iter()
        .enumerate()
        .map(|(i, t)| make_chunk(document_id, i as i64, t))
        .collect()
}

/// Splits an oversized paragraph at whitespace, each piece at most
/// `max_chars` bytes, consecutive pieces sharing up to `overlap_chars`.
fn hard_split(para: &str, max_chars: usize, overlap_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut start = 0;

    loop {
        let remaining = &para[start..];
        if remaining.len() <= max_chars {
            let piece = remaining.trim();
            if !piece.is_empty() {
                pieces.push(piece.to_string());
            }
            break;
        }

        let limit = floor_char_boundary(remaining, max_chars);
        let cut = remaining[..limit]
            .rfind(char::is_whitespace)
            .filter(|&p| p > 0)
            .unwrap_or(limit);
        let piece = remaining[..cut].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }

        let end = start + cut;
        let carried = tail(&para[start..end], overlap_chars).len();
        let next = end - carried;
        start = if next > start { next } else { end };
        start += para[start..].len() - para[start..].trim_start().len();
    }

    pieces
}

/// The last `max_chars` bytes of `s`, starting at a word boundary. Empty
/// when no boundary falls inside that window.
fn tail(s: &str, max_chars: usize) -> &str {
    if max_chars == 0 || s.is_empty() {
        return "";
    }
    if s.len() <= max_chars {
        return s;
    }
    let mut start = s.len() - max_chars;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    match s[start..].find(char::is_whitespace) {
        Some(ws) => s[start + ws..].trim_start(),
        None => "",
    }
}

fn floor_char_boundary(s: &str, idx: usize) -> usize {
    let mut i = idx.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

pub fn chunk_id(document_id: &str, index: i64) -> String {
    let name = format!("estate-chunk:{}:{}", document_id, index);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    Chunk {
        id: chunk_id(document_id, index),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash: hash_text(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_text("doc1", "Bail à loyer, Gare 28.", 250, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Bail à loyer, Gare 28.");
    }

    #[test]
    fn empty_text_still_yields_one_chunk() {
        let chunks = chunk_text("doc1", "", 250, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[test]
    fn indices_are_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraphe numéro {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text("doc1", &text, 10, 2);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64, "Index mismatch at position {}", i);
        }
    }

    #[test]
    fn ids_are_deterministic_per_document() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let c1 = chunk_text("doc1", text, 2, 0);
        let c2 = chunk_text("doc1", text, 2, 0);
        let other = chunk_text("doc2", text, 2, 0);
        assert_eq!(c1.len(), c2.len());
        for (a, b) in c1.iter().zip(c2.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.hash, b.hash);
        }
        assert_ne!(c1[0].id, other[0].id);
    }

    #[test]
    fn overlap_carries_tail_words() {
        let text = "alpha beta gamma delta\n\nepsilon zeta eta theta";
        let with = chunk_text("doc1", text, 10, 3);
        assert_eq!(with.len(), 2);
        assert_eq!(with[0].text, "alpha beta gamma delta");
        assert!(with[1].text.starts_with("gamma delta"));
        assert!(with[1].text.ends_with("epsilon zeta eta theta"));

        let without = chunk_text("doc1", text, 10, 0);
        assert_eq!(without[1].text, "epsilon zeta eta theta");
    }

    #[test]
    fn hard_split_respects_limit_and_char_boundaries() {
        let para = "Le locataire s'engage à entretenir la pièce d'eau, le réduit et le dépôt ".repeat(20);
        let chunks = chunk_text("doc1", &para, 5, 1);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.len() <= 20, "chunk too long: {:?}", c.text);
            assert!(!c.text.is_empty());
        }
        assert!(chunks.iter().any(|c| c.text.contains("dépôt")));
    }

    #[test]
    fn unbroken_text_is_split() {
        let word = "é".repeat(100);
        let chunks = chunk_text("doc1", &word, 5, 2);
        let total: usize = chunks.iter().map(|c| c.text.chars().count()).sum();
        assert_eq!(total, 100);
    }
}
