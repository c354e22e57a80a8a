//! Serialization of externalized objects and proxies.
//!
//! Every stored blob is tagged with an encoding identifier so formats can
//! evolve: a decoder refuses data whose tag it does not know instead of
//! misinterpreting it. The current encodings use postcard.

use bytes::Bytes;

use crate::{
    keys::ResolutionContext,
    mesh::ExternalizedMeshObject,
    proxy::ExternalizedProxy,
};

/// Encoding identifier for mesh object blobs.
pub const MESH_OBJECT_ENCODING: &str = "meshobject-postcard-v1";

/// Encoding identifier for proxy blobs.
pub const PROXY_ENCODING: &str = "proxy-postcard-v1";

#[derive(Debug, thiserror::Error)]
#[error("encoding failed: {0}")]
pub struct EncodeError(#[from] postcard::Error);

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown encoding id {0:?}")]
    UnknownEncoding(String),
    #[error("decoding failed: {0}")]
    Postcard(#[from] postcard::Error),
}

pub fn encode_mesh_object(ext: &ExternalizedMeshObject) -> Result<Bytes, EncodeError> {
    Ok(postcard::to_stdvec(ext)?.into())
}

/// Decodes a mesh object blob, re-interning all identifiers through `ctx`.
pub fn decode_mesh_object(
    encoding_id: &str,
    data: &[u8],
    ctx: &dyn ResolutionContext,
) -> Result<ExternalizedMeshObject, DecodeError> {
    if encoding_id != MESH_OBJECT_ENCODING {
        return Err(DecodeError::UnknownEncoding(encoding_id.to_owned()));
    }
    let raw: ExternalizedMeshObject = postcard::from_bytes(data)?;
    Ok(intern_mesh_object(raw, ctx))
}

pub fn encode_proxy(ext: &ExternalizedProxy) -> Result<Bytes, EncodeError> {
    Ok(postcard::to_stdvec(ext)?.into())
}

/// Decodes a proxy blob. The embedded messages keep their identifiers
/// verbatim; only the channel endpoints are re-interned.
pub fn decode_proxy(
    encoding_id: &str,
    data: &[u8],
    ctx: &dyn ResolutionContext,
) -> Result<ExternalizedProxy, DecodeError> {
    if encoding_id != PROXY_ENCODING {
        return Err(DecodeError::UnknownEncoding(encoding_id.to_owned()));
    }
    let mut raw: ExternalizedProxy = postcard::from_bytes(data)?;
    raw.local = ctx.base_identifier(raw.local.as_str());
    raw.partner = ctx.base_identifier(raw.partner.as_str());
    Ok(raw)
}

fn intern_mesh_object(
    raw: ExternalizedMeshObject,
    ctx: &dyn ResolutionContext,
) -> ExternalizedMeshObject {
    ExternalizedMeshObject {
        identifier: ctx.object_identifier(raw.identifier.as_str()),
        types: raw
            .types
            .into_iter()
            .map(|t| ctx.type_identifier(t.as_str()))
            .collect(),
        properties: raw
            .properties
            .into_iter()
            .map(|(k, v)| (ctx.type_identifier(k.as_str()), v))
            .collect(),
        neighbors: raw
            .neighbors
            .into_iter()
            .map(|(n, roles)| {
                (
                    ctx.object_identifier(n.as_str()),
                    roles
                        .into_iter()
                        .map(|r| ctx.type_identifier(r.as_str()))
                        .collect(),
                )
            })
            .collect(),
        equivalents: raw
            .equivalents
            .into_iter()
            .map(|e| ctx.object_identifier(e.as_str()))
            .collect(),
        timestamps: raw.timestamps,
        is_dead: raw.is_dead,
        proxies: raw
            .proxies
            .into_iter()
            .map(|p| ctx.base_identifier(p.as_str()))
            .collect(),
        home_proxy: raw.home_proxy,
        lock_proxy: raw.lock_proxy,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        keys::{Interner, PropertyValue, Timestamps},
        mesh::MeshObject,
        message::XprisoMessage,
        proxy::{CoherenceSpecification, Proxy},
    };

    #[test]
    fn mesh_object_roundtrip_interns_identifiers() {
        let mut obj = MeshObject::new("obj-1".into(), Timestamps::now());
        obj.bless(&["Person".into()], 1).unwrap();
        obj.set_property_value("Name".into(), PropertyValue::Text("Ada".into()), 2)
            .unwrap();
        obj.relate("obj-2".into(), 3).unwrap();
        let ext = obj.to_externalized();

        let data = encode_mesh_object(&ext).unwrap();
        let interner = Interner::new();
        let decoded = decode_mesh_object(MESH_OBJECT_ENCODING, &data, &interner).unwrap();
        assert_eq!(decoded, ext);

        // identifiers share the interner's allocation
        let again = decode_mesh_object(MESH_OBJECT_ENCODING, &data, &interner).unwrap();
        assert!(Arc::ptr_eq(
            decoded.identifier.shared(),
            again.identifier.shared()
        ));
    }

    #[test]
    fn unknown_encoding_rejected() {
        let interner = Interner::new();
        let err = decode_mesh_object("meshobject-xml-v9", b"", &interner).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownEncoding(_)));
        let err = decode_proxy("proxy-xml-v9", b"", &interner).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownEncoding(_)));
    }

    #[test]
    fn proxy_roundtrip_is_exact() {
        let proxy = Proxy::new("m1".into(), "m2".into(), CoherenceSpecification::MustBeCurrent);
        let mut msg = XprisoMessage::new("m1".into(), "m2".into());
        msg.requested_locks.push("obj-1".into());
        proxy.enqueue_for_send(msg).unwrap();
        proxy.mark_sent();
        let mut queued = XprisoMessage::new("m1".into(), "m2".into());
        queued.resynchronize_requests.push("obj-2".into());
        proxy.enqueue_for_send(queued).unwrap();

        let ext = proxy.to_externalized();
        let data = encode_proxy(&ext).unwrap();
        let decoded = decode_proxy(PROXY_ENCODING, &data, &Interner::new()).unwrap();
        assert_eq!(decoded, ext);
    }
}
