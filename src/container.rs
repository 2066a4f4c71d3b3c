//! Containers as seen by the reconciler.
//!
//! A [`Container`] carries only the facts instance derivation needs:
//! image, declared labels, environment and network facts.  Rules look
//! labels up lazily through [`Labeled`], while registered instances get
//! the flat map built by [`instance_labels`].

use std::collections::HashMap;

/// Label naming the image without its tag.
pub const IMAGE_LABEL: &str = "image";
/// Label naming the image tag.
pub const TAG_LABEL: &str = "tag";
/// Prefix under which environment entries are exposed as labels.
pub const ENV_LABEL_PREFIX: &str = "env.";

const DEFAULT_TAG: &str = "latest";

/// A container running on this host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    /// Runtime id, also used as the instance name.
    pub id: String,
    /// Image reference, e.g. `nginx:1.21`.
    pub image: String,
    pub labels: HashMap<String, String>,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// Whether the container shares the host's network stack.
    pub host_network: bool,
    /// Published ports keyed by `<port>/<proto>`.
    pub ports: HashMap<String, Vec<PortBinding>>,
    /// Address assigned by the runtime, as reported (may be empty).
    pub ip_address: String,
}

/// A published port mapped onto the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

impl PortBinding {
    pub fn new(host_ip: impl Into<String>, host_port: impl Into<String>) -> Self {
        Self {
            host_ip: host_ip.into(),
            host_port: host_port.into(),
        }
    }
}

/// Resolve a named attribute of something to a string.
pub trait Labeled {
    fn label(&self, name: &str) -> Option<&str>;
}

impl Labeled for Container {
    fn label(&self, name: &str) -> Option<&str> {
        match name {
            IMAGE_LABEL => Some(image_name(&self.image)),
            TAG_LABEL => Some(image_tag(&self.image)),
            _ => match name.strip_prefix(ENV_LABEL_PREFIX) {
                Some(key) if !key.is_empty() => env_value(&self.env, key),
                _ => self.labels.get(name).map(String::as_str),
            },
        }
    }
}

/// Labels recorded on an instance derived from `container`.
///
/// Synthetic `image`, `tag` and `env.<KEY>` entries come first; the
/// container's declared labels overwrite them on collision.
pub fn instance_labels(container: &Container) -> HashMap<String, String> {
    let mut labels = HashMap::with_capacity(2 + container.env.len() + container.labels.len());
    labels.insert(IMAGE_LABEL.to_string(), image_name(&container.image).to_string());
    labels.insert(TAG_LABEL.to_string(), image_tag(&container.image).to_string());
    for entry in &container.env {
        let (key, value) = split_env(entry);
        labels.insert(format!("{ENV_LABEL_PREFIX}{key}"), value.to_string());
    }
    for (k, v) in &container.labels {
        labels.insert(k.clone(), v.clone());
    }
    labels
}

/// Image reference up to the last `:`.
pub fn image_name(image: &str) -> &str {
    match image.rfind(':') {
        Some(colon) => &image[..colon],
        None => image,
    }
}

/// Image tag after the last `:`, or `latest`.
pub fn image_tag(image: &str) -> &str {
    match image.rfind(':') {
        Some(colon) => &image[colon + 1..],
        None => DEFAULT_TAG,
    }
}

// An entry without `=` is a key with an empty value.
fn split_env(entry: &str) -> (&str, &str) {
    entry.split_once('=').unwrap_or((entry, ""))
}

// Last entry wins, matching what `instance_labels` records.
fn env_value<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter()
        .rev()
        .map(|entry| split_env(entry))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}
