//! Pluggable text embedders.
//!
//! The store only requires an [`Embedder`] with a stable dimensionality.
//! Without a model, [`HashEmbedder`] provides a deterministic hashed
//! bag-of-words embedding so tests and offline runs stay reproducible;
//! a FastEmbed-style model slots in through the same trait.

/// Produces fixed-dimension embeddings for text.
pub trait Embedder: Send + Sync {
    /// Embedding dimensionality; must be constant across calls.
    fn dim(&self) -> usize;
    /// Embed each input text into a vector of `dim()` floats.
    fn embed(&self, texts: &[&str]) -> Vec<Vec<f32>>;
}

/// Deterministic hashed bag-of-words embedder.
///
/// Tokens are lowercased, hashed into a bucket with a sign bit, and the
/// resulting vector is L2-normalized.  Same text → same vector, across
/// processes and platforms.
pub struct HashEmbedder {
    dim: usize,
}

/// The default dimensionality matches common sentence-embedding models.
pub const DEFAULT_DIM: usize = 1536;

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIM)
    }
}

impl Embedder for HashEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, texts: &[&str]) -> Vec<Vec<f32>> {
        texts.iter().map(|t| self.embed_one(t)).collect()
    }
}

impl HashEmbedder {
    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dim];
        for token in tokenize(text) {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dim as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }
        l2_normalize(&mut vec);
        vec
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// FNV-1a — stable across platforms, unlike the std hasher's random keys.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_is_deterministic() {
        let e = HashEmbedder::default();
        let a = e.embed(&["run the tests"]);
        let b = e.embed(&["run the tests"]);
        assert_eq!(a, b);
        assert_eq!(a[0].len(), DEFAULT_DIM);
    }

    #[test]
    fn embedding_is_normalized() {
        let e = HashEmbedder::default();
        let v = &e.embed(&["some longer text with many tokens here"])[0];
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let e = HashEmbedder::default();
        let vs = e.embed(&[
            "run the unit tests with pytest",
            "execute tests using pytest",
            "bake a chocolate cake",
        ]);
        let sim_related = cosine_similarity(&vs[0], &vs[1]);
        let sim_unrelated = cosine_similarity(&vs[0], &vs[2]);
        assert!(sim_related > sim_unrelated);
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let e = HashEmbedder::new(8);
        let v = &e.embed(&[""])[0];
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn cosine_identical_is_one() {
        let v = vec![0.5f32, 0.5, 0.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }
}
