use crate::calibrator::CalibrationState;
use crate::config::{BucketLayout, IndexConfig};
use crate::errors::IndexError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sketchdb_blockstore::ByteStore;
use sketchdb_distance::{Distance, MetricObject};
use std::sync::Arc;

const FINGERPRINT_KEY: &[u8] = b"fingerprint";
const FROZEN_KEY: &[u8] = b"frozen";
const PIVOTS_KEY: &[u8] = b"pivots";
const CALIBRATION_KEY: &[u8] = b"calibration";
const NEXT_ID_KEY: &[u8] = b"next_id";
const LEN_KEY: &[u8] = b"len";
const STAGE_PREFIX: &[u8] = b"stage/";

/// The settings that fix the on-disk shape of an index. Reopening with a
/// different fingerprint would misread every bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFingerprint {
    pub sketch_bits: usize,
    pub bucket_pivot_count: usize,
    pub layout: BucketLayout,
}

impl From<&IndexConfig> for IndexFingerprint {
    fn from(config: &IndexConfig) -> Self {
        IndexFingerprint {
            sketch_bits: config.sketch_bits,
            bucket_pivot_count: config.bucket_pivot_count,
            layout: config.layout,
        }
    }
}

/// Index metadata kept in its own byte store: pivots, calibration samples,
/// counters and the staging area used before freeze.
#[derive(Clone, Debug)]
pub(crate) struct MetaStore {
    store: Arc<dyn ByteStore>,
}

fn stage_key(id: i64) -> Vec<u8> {
    let mut key = STAGE_PREFIX.to_vec();
    id.put_sortable(&mut key);
    key
}

impl MetaStore {
    pub(crate) fn new(store: Arc<dyn ByteStore>) -> Self {
        MetaStore { store }
    }

    pub(crate) async fn fingerprint(&self) -> Result<Option<IndexFingerprint>, IndexError> {
        match self.store.get(FINGERPRINT_KEY).await? {
            Some(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| IndexError::Metadata(format!("fingerprint: {e}"))),
            None => Ok(None),
        }
    }

    pub(crate) async fn put_fingerprint(
        &self,
        fingerprint: &IndexFingerprint,
    ) -> Result<(), IndexError> {
        let data = serde_json::to_vec(fingerprint)
            .map_err(|e| IndexError::Metadata(format!("fingerprint: {e}")))?;
        self.store.put(FINGERPRINT_KEY, Bytes::from(data)).await?;
        Ok(())
    }

    pub(crate) async fn is_frozen(&self) -> Result<bool, IndexError> {
        Ok(self.store.get(FROZEN_KEY).await?.is_some())
    }

    pub(crate) async fn mark_frozen(&self) -> Result<(), IndexError> {
        self.store.put(FROZEN_KEY, Bytes::from_static(&[1])).await?;
        Ok(())
    }

    async fn get_i64(&self, key: &[u8]) -> Result<Option<i64>, IndexError> {
        match self.store.get(key).await? {
            Some(data) if data.len() == 8 => Ok(Some((&data[..]).get_i64_le())),
            Some(data) => Err(IndexError::Metadata(format!(
                "{} holds {} bytes, expected 8",
                String::from_utf8_lossy(key),
                data.len()
            ))),
            None => Ok(None),
        }
    }

    async fn put_i64(&self, key: &[u8], value: i64) -> Result<(), IndexError> {
        self.store
            .put(key, Bytes::copy_from_slice(&value.to_le_bytes()))
            .await?;
        Ok(())
    }

    pub(crate) async fn next_id(&self) -> Result<i64, IndexError> {
        Ok(self.get_i64(NEXT_ID_KEY).await?.unwrap_or(0))
    }

    pub(crate) async fn put_next_id(&self, next_id: i64) -> Result<(), IndexError> {
        self.put_i64(NEXT_ID_KEY, next_id).await
    }

    pub(crate) async fn len(&self) -> Result<u64, IndexError> {
        Ok(self.get_i64(LEN_KEY).await?.unwrap_or(0).max(0) as u64)
    }

    pub(crate) async fn put_len(&self, len: u64) -> Result<(), IndexError> {
        self.put_i64(LEN_KEY, len as i64).await
    }

    /// Sketch pivots, flattened pair by pair:
    /// `count: u32 | (len: u32 | payload) * count`.
    pub(crate) async fn pivots<O: MetricObject>(&self) -> Result<Option<Vec<(O, O)>>, IndexError> {
        let Some(data) = self.store.get(PIVOTS_KEY).await? else {
            return Ok(None);
        };
        let truncated = || IndexError::Metadata("pivots truncated".to_string());
        let mut buf = &data[..];
        if buf.remaining() < 4 {
            return Err(truncated());
        }
        let count = buf.get_u32_le() as usize;
        if count % 2 != 0 {
            return Err(IndexError::Metadata(format!("odd pivot count {count}")));
        }
        let mut objects = Vec::with_capacity(count.min(buf.remaining() / 4));
        for _ in 0..count {
            if buf.remaining() < 4 {
                return Err(truncated());
            }
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(truncated());
            }
            let object =
                O::decode(&buf[..len]).map_err(|e| IndexError::Metadata(format!("pivot: {e}")))?;
            buf.advance(len);
            objects.push(object);
        }
        let mut pairs = Vec::with_capacity(count / 2);
        let mut objects = objects.into_iter();
        while let (Some(a), Some(b)) = (objects.next(), objects.next()) {
            pairs.push((a, b));
        }
        Ok(Some(pairs))
    }

    pub(crate) async fn put_pivots<O: MetricObject>(
        &self,
        pairs: &[(O, O)],
    ) -> Result<(), IndexError> {
        let mut buf = BytesMut::new();
        buf.put_u32_le((pairs.len() * 2) as u32);
        for (a, b) in pairs {
            for object in [a, b] {
                let payload = object.encode();
                buf.put_u32_le(payload.len() as u32);
                buf.put_slice(&payload);
            }
        }
        self.store.put(PIVOTS_KEY, buf.freeze()).await?;
        Ok(())
    }

    pub(crate) async fn calibration(&self) -> Result<CalibrationState, IndexError> {
        match self.store.get(CALIBRATION_KEY).await? {
            Some(data) => serde_json::from_slice(&data)
                .map_err(|e| IndexError::Metadata(format!("calibration: {e}"))),
            None => Ok(CalibrationState::default()),
        }
    }

    pub(crate) async fn put_calibration(&self, state: &CalibrationState) -> Result<(), IndexError> {
        let data = serde_json::to_vec(state)
            .map_err(|e| IndexError::Metadata(format!("calibration: {e}")))?;
        self.store.put(CALIBRATION_KEY, Bytes::from(data)).await?;
        Ok(())
    }

    pub(crate) async fn stage<O: MetricObject>(&self, id: i64, object: &O) -> Result<(), IndexError> {
        self.store
            .put(&stage_key(id), Bytes::from(object.encode()))
            .await?;
        Ok(())
    }

    pub(crate) async fn unstage(&self, id: i64) -> Result<bool, IndexError> {
        Ok(self.store.delete(&stage_key(id)).await?)
    }

    /// Staged objects in id order.
    pub(crate) async fn staged<O: MetricObject>(&self) -> Result<Vec<(i64, O)>, IndexError> {
        self.store
            .prefix_scan(STAGE_PREFIX)
            .await?
            .into_iter()
            .map(|(key, value)| {
                let id = i64::try_get_sortable(&mut &key[STAGE_PREFIX.len()..])
                    .ok_or_else(|| IndexError::Metadata(format!("bad staging key {key:?}")))?;
                let object = O::decode(&value)
                    .map_err(|e| IndexError::Metadata(format!("staged object {id}: {e}")))?;
                Ok((id, object))
            })
            .collect()
    }

    pub(crate) async fn clear_stage(&self) -> Result<(), IndexError> {
        for key in self.store.scan_keys(STAGE_PREFIX).await? {
            self.store.delete(&key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sketchdb_blockstore::MemoryByteStore;
    use sketchdb_distance::EditString;

    fn meta() -> MetaStore {
        MetaStore::new(Arc::new(MemoryByteStore::new()))
    }

    #[tokio::test]
    async fn test_counters_default_to_zero() {
        let meta = meta();
        assert_eq!(meta.next_id().await.unwrap(), 0);
        assert_eq!(meta.len().await.unwrap(), 0);
        meta.put_next_id(12).await.unwrap();
        meta.put_len(7).await.unwrap();
        assert_eq!(meta.next_id().await.unwrap(), 12);
        assert_eq!(meta.len().await.unwrap(), 7);
        assert!(!meta.is_frozen().await.unwrap());
        meta.mark_frozen().await.unwrap();
        assert!(meta.is_frozen().await.unwrap());
    }

    #[tokio::test]
    async fn test_pivots_persist_in_pair_order() {
        let meta = meta();
        assert!(meta.pivots::<EditString>().await.unwrap().is_none());
        let pairs = vec![
            (EditString("a".into()), EditString("".into())),
            (EditString("ccc".into()), EditString("dd".into())),
        ];
        meta.put_pivots(&pairs).await.unwrap();
        let loaded = meta.pivots::<EditString>().await.unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].0 .0, "a");
        assert_eq!(loaded[0].1 .0, "");
        assert_eq!(loaded[1].0 .0, "ccc");
        assert_eq!(loaded[1].1 .0, "dd");
    }

    #[tokio::test]
    async fn test_truncated_pivots_are_rejected() {
        let store = Arc::new(MemoryByteStore::new());
        store
            .put(PIVOTS_KEY, Bytes::from_static(&[2, 0, 0, 0, 9, 0, 0, 0, b'x']))
            .await
            .unwrap();
        let err = MetaStore::new(store).pivots::<EditString>().await.unwrap_err();
        assert!(matches!(err, IndexError::Metadata(_)));
    }

    #[tokio::test]
    async fn test_staging_is_ordered_by_id() {
        let meta = meta();
        for id in [300, -1, 2] {
            meta.stage(id, &EditString(format!("o{id}"))).await.unwrap();
        }
        let staged: Vec<i64> = meta
            .staged::<EditString>()
            .await
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(staged, vec![-1, 2, 300]);
        assert!(meta.unstage(2).await.unwrap());
        assert!(!meta.unstage(2).await.unwrap());
        meta.clear_stage().await.unwrap();
        assert!(meta.staged::<EditString>().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fingerprint_round_trip() {
        let meta = meta();
        assert_eq!(meta.fingerprint().await.unwrap(), None);
        let fingerprint = IndexFingerprint::from(&IndexConfig::default());
        meta.put_fingerprint(&fingerprint).await.unwrap();
        assert_eq!(meta.fingerprint().await.unwrap(), Some(fingerprint));
    }
}
