//! Deterministic text embeddings for plan template matching.
//!
//! Feature hashing (FNV-1a) over lower-cased tokens and adjacent token pairs,
//! L2 normalised. Texts that differ only in case and punctuation get
//! identical vectors, which is what the plan cache relies on once entities
//! are replaced by placeholders. The pairs keep word order in play, so "from
//! {LOCATION} to {LOCATION_2}" and "to {LOCATION} from {LOCATION_2}" land
//! apart.

pub const EMBEDDING_DIM: usize = 256;

/// Embed a text. Returns `None` when it has no tokens.
pub fn embed_text(text: &str) -> Option<Vec<f32>> {
    let tokens: Vec<String> = text
        .split_whitespace()
        .map(|token| {
            token
                .trim_matches(|c: char| !c.is_alphanumeric() && c != '{' && c != '}' && c != '_')
                .to_lowercase()
        })
        .filter(|token| !token.is_empty())
        .collect();
    if tokens.is_empty() {
        return None;
    }

    let mut out = vec![0.0_f32; EMBEDDING_DIM];
    for token in &tokens {
        add_feature(&mut out, token.as_bytes());
    }
    for pair in tokens.windows(2) {
        add_feature(&mut out, format!("{} {}", pair[0], pair[1]).as_bytes());
    }

    let norm = l2_norm(&out);
    if norm <= f32::EPSILON {
        return None;
    }
    for value in &mut out {
        *value /= norm;
    }
    Some(out)
}

/// Cosine similarity; 0.0 for mismatched lengths or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let (a_norm, b_norm) = (l2_norm(a), l2_norm(b));
    if a_norm == 0.0 || b_norm == 0.0 {
        return 0.0;
    }
    let dot = a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
    (dot / (a_norm * b_norm)).clamp(-1.0, 1.0)
}

/// Little-endian f32 blob for SQLite storage
pub fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`encode_embedding`]; `None` if the blob is not a whole number of f32s
pub fn decode_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

fn add_feature(out: &mut [f32], feature: &[u8]) {
    let hash = stable_hash(feature);
    let idx = (hash as usize) % out.len();
    let sign = if (hash >> 63) == 0 { 1.0_f32 } else { -1.0_f32 };
    out[idx] += sign;
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

fn stable_hash(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325_u64;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3_u64);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_tokens_same_vector() {
        let a = embed_text("Book a flight to {LOCATION}").unwrap();
        let b = embed_text("book a FLIGHT to {LOCATION}.").unwrap();
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_unrelated_texts_score_lower() {
        let a = embed_text("book a flight to {LOCATION} on {DATE}").unwrap();
        let b = embed_text("delete the customer record").unwrap();
        assert!(cosine_similarity(&a, &b) < 0.5);
    }

    #[test]
    fn test_word_order_matters() {
        let outbound = embed_text("fly from {LOCATION} to {LOCATION_2}").unwrap();
        let reversed = embed_text("fly to {LOCATION} from {LOCATION_2}").unwrap();
        let similarity = cosine_similarity(&outbound, &reversed);
        assert!(similarity < 0.85, "reordered text scored {}", similarity);
        assert!(similarity > 0.0);
    }

    #[test]
    fn test_empty_text_has_no_embedding() {
        assert!(embed_text("  ... ").is_none());
    }

    #[test]
    fn test_blob_encoding() {
        let values = embed_text("weather in {LOCATION}").unwrap();
        assert_eq!(decode_embedding(&encode_embedding(&values)).unwrap(), values);
        assert!(decode_embedding(&[1, 2, 3]).is_none());
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }
}
