//! Extended attribute namespace.
//!
//! A fixed, enumerated set of attributes rather than an open-ended
//! dictionary: one writable attribute for the resource content type
//! (honored only between create and first flush, when it decides the
//! upload's Content-Type) and a family of read-only attributes
//! mirroring selected response headers.

use crate::resource::ResourceHandle;

/// The supported extended attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodAttr {
    /// `user.mime_type` — content type of the resource. The one
    /// writable attribute, settable only before the first upload.
    MimeType,
    /// `user.pod.etag` — validator from the last fetch.
    Etag,
    /// `user.pod.last_modified` — Last-Modified header, RFC 3339.
    LastModified,
    /// `user.pod.content_type` — Content-Type header as reported.
    ContentType,
    /// `user.pod.url` — the remote URL backing this path.
    Url,
}

impl PodAttr {
    /// All attributes, in listxattr order.
    pub const ALL: [PodAttr; 5] = [
        PodAttr::MimeType,
        PodAttr::Etag,
        PodAttr::LastModified,
        PodAttr::ContentType,
        PodAttr::Url,
    ];

    /// Parses an attribute name; unknown names are unsupported.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "user.mime_type" => Some(PodAttr::MimeType),
            "user.pod.etag" => Some(PodAttr::Etag),
            "user.pod.last_modified" => Some(PodAttr::LastModified),
            "user.pod.content_type" => Some(PodAttr::ContentType),
            "user.pod.url" => Some(PodAttr::Url),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PodAttr::MimeType => "user.mime_type",
            PodAttr::Etag => "user.pod.etag",
            PodAttr::LastModified => "user.pod.last_modified",
            PodAttr::ContentType => "user.pod.content_type",
            PodAttr::Url => "user.pod.url",
        }
    }

    /// Only the mime type may be written, and only at create time.
    pub fn is_writable(self) -> bool {
        matches!(self, PodAttr::MimeType)
    }

    /// Reads the attribute value from a handle; `None` when the
    /// underlying metadata was never observed.
    pub fn value(self, handle: &ResourceHandle) -> Option<String> {
        match self {
            PodAttr::MimeType | PodAttr::ContentType => handle.content_type.clone(),
            PodAttr::Etag => handle.etag.clone(),
            PodAttr::LastModified => handle.last_modified.map(|t| t.to_rfc3339()),
            PodAttr::Url => Some(handle.url.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;
    use url::Url;

    #[test]
    fn test_parse_round_trips_all_names() {
        for attr in PodAttr::ALL {
            assert_eq!(PodAttr::parse(attr.name()), Some(attr));
        }
        assert_eq!(PodAttr::parse("user.other"), None);
        assert_eq!(PodAttr::parse("security.selinux"), None);
    }

    #[test]
    fn test_only_mime_type_is_writable() {
        for attr in PodAttr::ALL {
            assert_eq!(attr.is_writable(), attr == PodAttr::MimeType);
        }
    }

    #[test]
    fn test_values_from_handle() {
        let base = Url::parse("https://pod.example/data/").unwrap();
        let mut handle = ResourceHandle::new(&base, "/a.txt", ResourceKind::Resource);
        assert_eq!(PodAttr::MimeType.value(&handle), None);
        assert_eq!(
            PodAttr::Url.value(&handle).as_deref(),
            Some("https://pod.example/data/a.txt")
        );

        handle.content_type = Some("text/markdown".into());
        handle.etag = Some("\"v3\"".into());
        assert_eq!(
            PodAttr::MimeType.value(&handle).as_deref(),
            Some("text/markdown")
        );
        assert_eq!(PodAttr::Etag.value(&handle).as_deref(), Some("\"v3\""));
    }
}
