use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList, PyType};
use pyo3_async_runtimes::tokio::future_into_py;

use crate::{
    AttrValue, Attributes, CacheError, CacheNode, InvalidationBus, NearCache, NearCacheConfig,
    NodeConfig, Predicate, RedisTransport, RemoveOutcome, Subscription, UnavailablePolicy,
};

type JsonNode = CacheNode<String, serde_json::Value>;

fn to_py_err(e: CacheError) -> PyErr {
    match e {
        CacheError::InvalidPredicate(_) | CacheError::InvalidConfig(_) => {
            PyValueError::new_err(e.to_string())
        }
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

// ============ JSON conversion helpers ============

/// Convert a serde_json::Value to a Python object
fn json_value_to_py(py: Python<'_>, v: &serde_json::Value) -> PyResult<Py<PyAny>> {
    match v {
        serde_json::Value::Null => Ok(py.None()),
        serde_json::Value::Bool(b) => Ok(b.into_pyobject(py)?.to_owned().into_any().unbind()),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i.into_pyobject(py)?.into_any().unbind())
            } else if let Some(f) = n.as_f64() {
                Ok(f.into_pyobject(py)?.into_any().unbind())
            } else {
                Ok(py.None())
            }
        }
        serde_json::Value::String(s) => Ok(s.into_pyobject(py)?.into_any().unbind()),
        serde_json::Value::Array(arr) => {
            let list = PyList::empty(py);
            for item in arr {
                list.append(json_value_to_py(py, item)?)?;
            }
            Ok(list.into_any().unbind())
        }
        serde_json::Value::Object(obj) => {
            let dict = PyDict::new(py);
            for (k, val) in obj {
                dict.set_item(k, json_value_to_py(py, val)?)?;
            }
            Ok(dict.into_any().unbind())
        }
    }
}

/// Round-trip a Python object through `json.dumps` into any deserializable type
fn py_to_json<T: serde::de::DeserializeOwned>(py: Python<'_>, obj: &Bound<'_, PyAny>) -> PyResult<T> {
    let json_mod = py.import("json")?;
    let json_str: String = json_mod.call_method1("dumps", (obj,))?.extract()?;
    serde_json::from_str(&json_str).map_err(|e| PyValueError::new_err(e.to_string()))
}

fn py_to_attributes(py: Python<'_>, obj: Option<&Bound<'_, PyAny>>) -> PyResult<Attributes> {
    match obj {
        Some(obj) if !obj.is_none() => py_to_json(py, obj),
        _ => Ok(Attributes::new()),
    }
}

// ============ Configuration ============

/// Cache node configuration
#[pyclass(name = "NodeConfig")]
#[derive(Clone)]
pub struct PyNodeConfig {
    inner: NodeConfig,
}

#[pymethods]
impl PyNodeConfig {
    #[new]
    #[pyo3(signature = (namespace, partitions=16, hot_capacity=10_000, cold_capacity=100_000))]
    fn new(namespace: String, partitions: usize, hot_capacity: usize, cold_capacity: usize) -> Self {
        Self {
            inner: NodeConfig {
                namespace,
                partitions,
                hot_capacity,
                cold_capacity,
                ..NodeConfig::default()
            },
        }
    }
}

/// Near cache configuration
#[pyclass(name = "NearCacheConfig")]
#[derive(Clone)]
pub struct PyNearCacheConfig {
    inner: NearCacheConfig,
}

#[pymethods]
impl PyNearCacheConfig {
    #[new]
    #[pyo3(signature = (max_size=5000, ttl_seconds=300, fetch_timeout_ms=2000, serve_expired=false))]
    fn new(max_size: u64, ttl_seconds: u64, fetch_timeout_ms: u64, serve_expired: bool) -> Self {
        Self {
            inner: NearCacheConfig {
                max_size,
                ttl: Duration::from_secs(ttl_seconds),
                fetch_timeout: Duration::from_millis(fetch_timeout_ms),
                on_unavailable: if serve_expired {
                    UnavailablePolicy::ServeExpired
                } else {
                    UnavailablePolicy::NotFound
                },
                invalidate_on_change: true,
            },
        }
    }
}

// ============ Cache Classes ============

/// Authoritative cache node holding JSON values under string keys
#[pyclass(name = "CacheNode")]
pub struct PyCacheNode {
    inner: Arc<JsonNode>,
    bus: Option<Arc<InvalidationBus>>,
    _membership: Option<Subscription>,
}

#[pymethods]
impl PyCacheNode {
    /// Create a new CacheNode.
    ///
    /// Args:
    ///     node_id: identity of this node within the cluster
    ///     config: NodeConfig instance
    ///     redis_url: optional Redis URL; when given, invalidations are
    ///         exchanged with other nodes over Redis pub/sub
    #[classmethod]
    #[pyo3(signature = (node_id, config, redis_url=None))]
    fn create<'py>(
        _cls: &Bound<'py, PyType>,
        py: Python<'py>,
        node_id: String,
        config: PyNodeConfig,
        redis_url: Option<String>,
    ) -> PyResult<Bound<'py, PyAny>> {
        future_into_py(py, async move {
            let node = JsonNode::new(node_id, config.inner).map_err(to_py_err)?;
            let Some(redis_url) = redis_url else {
                return Ok(PyCacheNode {
                    inner: Arc::new(node),
                    bus: None,
                    _membership: None,
                });
            };

            let redis_client = redis::Client::open(redis_url.as_str())
                .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
            let transport = RedisTransport::connect(redis_client).await.map_err(to_py_err)?;
            let bus = InvalidationBus::new(Arc::new(transport));
            let node = Arc::new(node.with_bus(Arc::clone(&bus)));
            let membership = node.join().await.map_err(to_py_err)?;
            Ok(PyCacheNode {
                inner: node,
                bus: Some(bus),
                _membership: Some(membership),
            })
        })
    }

    /// Put a value; returns the new version
    #[pyo3(signature = (key, value, attributes=None))]
    fn put(
        &self,
        py: Python<'_>,
        key: String,
        value: &Bound<'_, PyAny>,
        attributes: Option<&Bound<'_, PyAny>>,
    ) -> PyResult<Option<u64>> {
        let value: serde_json::Value = py_to_json(py, value)?;
        let attributes = py_to_attributes(py, attributes)?;
        Ok(self.inner.put(key, value, attributes).version())
    }

    /// Get a value, returns a Python object or None
    fn get(&self, py: Python<'_>, key: String) -> PyResult<Option<Py<PyAny>>> {
        match self.inner.get(&key).map_err(to_py_err)? {
            Some(entry) => json_value_to_py(py, &entry.value).map(Some),
            None => Ok(None),
        }
    }

    /// Remove a key; returns the removal version, or None if it was absent
    fn remove(&self, key: String) -> PyResult<Option<u64>> {
        match self.inner.remove(&key).map_err(to_py_err)? {
            RemoveOutcome::Removed { version } => Ok(Some(version)),
            RemoveOutcome::NotFound | RemoveOutcome::Stale { .. } => Ok(None),
        }
    }

    fn add_index(&self, attr: &str) -> bool {
        self.inner.add_index(attr)
    }

    /// Entries whose attribute `attr` equals `value`, as (key, value) pairs
    fn scan_equal(
        &self,
        py: Python<'_>,
        attr: String,
        value: &Bound<'_, PyAny>,
    ) -> PyResult<Vec<(String, Py<PyAny>)>> {
        let literal: AttrValue = py_to_json(py, value)?;
        let scan = self
            .inner
            .scan(Predicate::eq(attr, literal))
            .map_err(to_py_err)?;
        scan.map(|entry| Ok((entry.key.clone(), json_value_to_py(py, &entry.value)?)))
            .collect()
    }

    fn stats(&self) -> HashMap<String, u64> {
        let stats = self.inner.stats();
        HashMap::from([
            ("hot".to_owned(), stats.hot as u64),
            ("cold".to_owned(), stats.cold as u64),
            ("hits".to_owned(), stats.hits),
            ("misses".to_owned(), stats.misses),
            ("promotions".to_owned(), stats.promotions),
            ("demotions".to_owned(), stats.demotions),
            ("evictions".to_owned(), stats.evictions),
        ])
    }

    fn __repr__(&self) -> String {
        format!(
            "CacheNode(id='{}', namespace='{}', entries={})",
            self.inner.id(),
            self.inner.namespace(),
            self.inner.store().len()
        )
    }
}

/// Local, TTL-bounded cache in front of a CacheNode
#[pyclass(name = "NearCache")]
pub struct PyNearCache {
    inner: Arc<NearCache<String, serde_json::Value>>,
    _invalidations: Option<Subscription>,
}

#[pymethods]
impl PyNearCache {
    /// Create a near cache over `node`, following its invalidations when
    /// the node is connected to a cluster.
    #[classmethod]
    fn create<'py>(
        _cls: &Bound<'py, PyType>,
        py: Python<'py>,
        node: PyRef<'py, PyCacheNode>,
        config: PyNearCacheConfig,
    ) -> PyResult<Bound<'py, PyAny>> {
        let source = Arc::clone(&node.inner);
        let bus = node.bus.clone();
        let namespace = node.inner.namespace().to_owned();
        future_into_py(py, async move {
            let near = Arc::new(NearCache::<String, serde_json::Value>::new(source, config.inner).map_err(to_py_err)?);
            let invalidations = match bus {
                Some(bus) => Some(near.attach(&bus, &namespace).await.map_err(to_py_err)?),
                None => None,
            };
            Ok(PyNearCache {
                inner: near,
                _invalidations: invalidations,
            })
        })
    }

    /// Get a value, returns a Python object or None
    fn get<'py>(&self, py: Python<'py>, key: String) -> PyResult<Bound<'py, PyAny>> {
        let near = Arc::clone(&self.inner);
        future_into_py(py, async move {
            match near.get(&key).await.map_err(to_py_err)?.into_value() {
                Some(value) => Python::attach(|py| json_value_to_py(py, &value)).map(Some),
                None => Ok(None),
            }
        })
    }

    fn invalidate(&self, key: String) {
        self.inner.invalidate(&key);
    }

    fn stats(&self) -> HashMap<String, u64> {
        let stats = self.inner.stats();
        HashMap::from([
            ("hits".to_owned(), stats.hits),
            ("misses".to_owned(), stats.misses),
            ("expired".to_owned(), stats.expired),
            ("fetches".to_owned(), stats.fetches),
            ("invalidations".to_owned(), stats.invalidations),
        ])
    }
}

// ============ Module Registration ============

pub fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyNodeConfig>()?;
    m.add_class::<PyNearCacheConfig>()?;
    m.add_class::<PyCacheNode>()?;
    m.add_class::<PyNearCache>()?;
    Ok(())
}
