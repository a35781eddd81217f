use rustc_hash::FxHashMap;

/// Interned string pool for module images. Names are stored once and
/// referenced by index from declarations, entry tables and `Throw`
/// operands. Serialized as the flat name list; the index is rebuilt.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(
    feature = "serde_support",
    derive(serde::Serialize, serde::Deserialize),
    serde(from = "Vec<String>", into = "Vec<String>")
)]
pub struct NamePool {
    names: Vec<String>,
    index: FxHashMap<String, u32>,
}

impl NamePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(&i) = self.index.get(name) {
            return i;
        }
        let i = self.names.len() as u32;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), i);
        i
    }

    pub fn get(&self, index: u32) -> Option<&str> {
        self.names.get(index as usize).map(|s| s.as_str())
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl From<Vec<String>> for NamePool {
    fn from(names: Vec<String>) -> Self {
        let mut index = FxHashMap::default();
        for (i, n) in names.iter().enumerate() {
            index.insert(n.clone(), i as u32);
        }
        NamePool { names, index }
    }
}

impl From<NamePool> for Vec<String> {
    fn from(pool: NamePool) -> Self {
        pool.names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedup() {
        let mut pool = NamePool::new();
        let a = pool.intern("main");
        let b = pool.intern("node");
        let c = pool.intern("main");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(b), Some("node"));
        assert_eq!(pool.lookup("node"), Some(b));
        assert_eq!(pool.get(99), None);
    }

    #[test]
    fn test_rebuild_from_names() {
        let pool = NamePool::from(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(pool.lookup("b"), Some(1));
    }
}
