use crate::k8s::{labels::Map, ObjectMeta};

/// Operator-wide policy applied to everything the managers write.
pub trait ControllerContext: Send + Sync {
    /// Returns true if resources in `namespace` are managed by this
    /// controller instance.
    fn is_controlled(&self, namespace: &str) -> bool;

    /// Adds the labels configured for the resource, returning true if
    /// `labels` changed.
    fn set_labels(&self, namespace: &str, name: &str, kind: &str, labels: &mut Map) -> bool;

    /// Adds the annotations configured for the resource, returning true if
    /// `annotations` changed.
    fn set_annotations(
        &self,
        namespace: &str,
        name: &str,
        kind: &str,
        annotations: &mut Map,
    ) -> bool;

    /// The namespace the controller runs in.
    fn namespace(&self) -> &str;
}

/// A context configured once at startup.
#[derive(Clone, Debug, Default)]
pub struct StaticContext {
    namespace: String,
    watch_namespace: Option<String>,
    labels: Map,
    annotations: Map,
}

// === impl StaticContext ===

impl StaticContext {
    pub fn new(namespace: impl ToString, watch_namespace: Option<String>) -> Self {
        Self {
            namespace: namespace.to_string(),
            watch_namespace: watch_namespace.filter(|ns| !ns.is_empty()),
            ..Default::default()
        }
    }

    pub fn with_labels(mut self, labels: Map) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_annotations(mut self, annotations: Map) -> Self {
        self.annotations = annotations;
        self
    }
}

impl ControllerContext for StaticContext {
    fn is_controlled(&self, namespace: &str) -> bool {
        self.watch_namespace
            .as_deref()
            .map(|ns| ns == namespace)
            .unwrap_or(true)
    }

    fn set_labels(&self, _: &str, _: &str, _: &str, labels: &mut Map) -> bool {
        merge(&self.labels, labels)
    }

    fn set_annotations(&self, _: &str, _: &str, _: &str, annotations: &mut Map) -> bool {
        merge(&self.annotations, annotations)
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

fn merge(desired: &Map, actual: &mut Map) -> bool {
    let mut changed = false;
    for (k, v) in desired {
        if actual.get(k) != Some(v) {
            actual.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

/// Applies the context's labels and annotations to `meta`.
pub(crate) fn apply_metadata(
    context: &dyn ControllerContext,
    meta: &mut ObjectMeta,
    kind: &str,
) -> bool {
    let namespace = meta.namespace.clone().unwrap_or_default();
    let name = meta.name.clone().unwrap_or_default();

    let mut labels = meta.labels.take().unwrap_or_default();
    let mut changed = context.set_labels(&namespace, &name, kind, &mut labels);
    meta.labels = Some(labels).filter(|l| !l.is_empty());

    let mut annotations = meta.annotations.take().unwrap_or_default();
    changed |= context.set_annotations(&namespace, &name, kind, &mut annotations);
    meta.annotations = Some(annotations).filter(|a| !a.is_empty());

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn watch_namespace_limits_control() {
        let all = StaticContext::new("skupper", None);
        assert!(all.is_controlled("anything"));

        let one = StaticContext::new("skupper", Some("test".to_string()));
        assert!(one.is_controlled("test"));
        assert!(!one.is_controlled("other"));
    }

    #[test]
    fn metadata_is_merged() {
        let context = StaticContext::new("skupper", None)
            .with_labels(btreemap! { "foo".to_string() => "bar".to_string() })
            .with_annotations(btreemap! { "abc".to_string() => "123".to_string() });
        let mut meta = ObjectMeta {
            name: Some("mysvc".to_string()),
            namespace: Some("test".to_string()),
            labels: Some(btreemap! { "app".to_string() => "x".to_string() }),
            ..Default::default()
        };
        assert!(apply_metadata(&context, &mut meta, "Service"));
        assert_eq!(
            meta.labels,
            Some(btreemap! {
                "app".to_string() => "x".to_string(),
                "foo".to_string() => "bar".to_string(),
            })
        );
        assert_eq!(
            meta.annotations,
            Some(btreemap! { "abc".to_string() => "123".to_string() })
        );
        assert!(!apply_metadata(&context, &mut meta, "Service"));

        let empty = StaticContext::new("skupper", None);
        let mut bare = ObjectMeta::default();
        assert!(!apply_metadata(&empty, &mut bare, "Service"));
        assert_eq!(bare.labels, None);
    }
}
