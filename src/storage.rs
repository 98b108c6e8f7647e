/*!
 * In-Memory Storage
 *
 * The keyspace dictionary. The server is a single-threaded reactor, so the
 * dictionary needs no internal locking; one `Dict` exists per selectable
 * database.
 */

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

/// Value types stored in the keyspace.
///
/// Integers are an encoding of string values: they decode to their decimal
/// form whenever a command needs raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// String/binary data.
    Str(Vec<u8>),
    /// 64-bit signed integer.
    Int(i64),
}

/// In-memory dictionary mapping binary keys to values.
#[derive(Default)]
pub struct Dict {
    inner: HashMap<Vec<u8>, Value>,
}

impl Dict {
    /// Get a value by key.
    #[inline]
    pub fn get(&self, k: &[u8]) -> Option<&Value> {
        self.inner.get(k)
    }

    /// Set a key-value pair, replacing any previous value.
    #[inline]
    pub fn set(&mut self, k: Vec<u8>, v: Value) {
        self.inner.insert(k, v);
    }

    /// Delete a key.
    ///
    /// # Returns
    /// * `true` if the key existed and was deleted
    #[inline]
    pub fn del(&mut self, k: &[u8]) -> bool {
        self.inner.remove(k).is_some()
    }

    /// Check if a key exists without retrieving the value.
    #[inline]
    pub fn exists(&self, k: &[u8]) -> bool {
        self.inner.contains_key(k)
    }

    /// Move the value stored at `from` to `to`.
    ///
    /// # Returns
    /// * `true` if the source key existed
    pub fn rename(&mut self, from: Vec<u8>, to: Vec<u8>) -> bool {
        if from == to {
            return self.inner.contains_key(&from);
        }
        if let Some(v) = self.inner.remove(&from) {
            self.inner.insert(to, v);
            true
        } else {
            false
        }
    }

    /// Increment the integer value stored under `k`, creating it at 1 when
    /// missing. String values must parse as a decimal integer.
    ///
    /// # Returns
    /// * `Some(new_value)` on success
    /// * `None` when the stored value is not an integer
    pub fn incr(&mut self, k: &[u8]) -> Option<i64> {
        match self.inner.entry(k.to_vec()) {
            Entry::Occupied(mut e) => match e.get_mut() {
                Value::Int(i) => {
                    *i += 1;
                    Some(*i)
                }
                Value::Str(s) => {
                    let n = std::str::from_utf8(s).ok()?.parse::<i64>().ok()? + 1;
                    *s = n.to_string().into_bytes();
                    Some(n)
                }
            },
            Entry::Vacant(v) => {
                v.insert(Value::Int(1));
                Some(1)
            }
        }
    }

    /// Number of keys.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
