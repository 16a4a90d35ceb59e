//! Filtered chunks read end to end through the file handle

mod common;

use common::*;
use h5chunk::filters::{shuffle, FILTER_DEFLATE, FILTER_NBIT};
use h5chunk::layout::chunk_size_length;
use h5chunk::scale_offset::ScaleOffsetParameters;
use h5chunk::{
    ChunkIndexDescriptor, FileConfig, FilterDescription, FilterPipeline, FilterRegistry, H5Error,
    H5File, Selection, UNLIMITED,
};

const NAME: &str = "filtered";
const DIMS: [u64; 2] = [14, 14];
const CHUNK_DIMS: [u64; 2] = [4, 5];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    SingleChunk,
    BTree1,
    FixedArray,
    ExtensibleArray,
    BTree2,
}

const FILTERED_KINDS: [Kind; 5] = [
    Kind::SingleChunk,
    Kind::BTree1,
    Kind::FixedArray,
    Kind::ExtensibleArray,
    Kind::BTree2,
];

fn filtered_file(
    kind: Kind,
    pipeline: FilterPipeline,
    config: FileConfig,
    encode: &dyn Fn(&[u64], Vec<u8>) -> (Vec<u8>, u32),
) -> H5File {
    let chunk_dims = if kind == Kind::SingleChunk {
        DIMS.to_vec()
    } else {
        CHUNK_DIMS.to_vec()
    };

    let mut builder = ImageBuilder::new();
    let value = linear_value(&DIMS);
    let chunks = write_encoded_chunks(&mut builder, &DIMS, &chunk_dims, &value, encode);
    let scaled = scaled_dims(&DIMS, &chunk_dims);
    let chunk_byte_size = chunk_dims.iter().product::<u64>() * 4;
    let size_length = Some(chunk_size_length(chunk_byte_size));

    let (index, max_dims) = match kind {
        Kind::SingleChunk => {
            let stored = chunks[0].1;
            (
                ChunkIndexDescriptor::SingleChunk {
                    address: stored.address,
                    filtered: Some((stored.size, stored.mask)),
                },
                DIMS.to_vec(),
            )
        }
        Kind::BTree1 => {
            let address = btree1(&mut builder, &DIMS, &chunk_dims, &chunks, 5);
            (ChunkIndexDescriptor::BTree1 { address }, DIMS.to_vec())
        }
        Kind::FixedArray => {
            let address = fixed_array(&mut builder, &linear_entries(&chunks, &scaled), size_length);
            (ChunkIndexDescriptor::FixedArray { address }, DIMS.to_vec())
        }
        Kind::ExtensibleArray => {
            let address =
                extensible_array(&mut builder, &linear_entries(&chunks, &scaled), size_length);
            (ChunkIndexDescriptor::ExtensibleArray { address }, vec![UNLIMITED, 14])
        }
        Kind::BTree2 => {
            let address = btree2(&mut builder, 2, chunk_byte_size, &chunks, true);
            (ChunkIndexDescriptor::BTree2 { address }, vec![UNLIMITED, UNLIMITED])
        }
    };

    let descriptor = chunked_i32(&DIMS, &chunk_dims, index)
        .with_max_dims(max_dims)
        .with_filters(pipeline);

    let file = H5File::from_source(builder.into_source(), config);
    file.register_dataset(NAME, descriptor)
        .expect("Failed to register filtered dataset");
    file
}

fn encoder(pipeline: &FilterPipeline) -> impl Fn(&[u64], Vec<u8>) -> (Vec<u8>, u32) + '_ {
    let registry = FilterRegistry::default();
    move |_, raw| pipeline.encode(&registry, raw).expect("Failed to encode chunk")
}

fn expected_all() -> Vec<i32> {
    let value = linear_value(&DIMS);
    (0..14u64)
        .flat_map(|i| (0..14u64).map(move |j| [i, j]))
        .map(|coords| value(&coords))
        .collect()
}

/// Shuffle, deflate and Fletcher-32 decode in reverse order for every index kind
#[tokio::test]
async fn test_shuffle_deflate_fletcher32() {
    let pipeline = FilterPipeline::new(vec![
        FilterDescription::shuffle(4),
        FilterDescription::deflate(6),
        FilterDescription::fletcher32(),
    ]);

    for kind in FILTERED_KINDS {
        let file = filtered_file(kind, pipeline.clone(), FileConfig::default(), &encoder(&pipeline));
        let dataset = file.dataset(NAME).await.expect("Failed to open dataset");

        let values = dataset.read_array::<i32>(&Selection::All).await.unwrap();
        assert_eq!(
            values.iter().copied().collect::<Vec<_>>(),
            expected_all(),
            "index kind {:?}",
            kind
        );

        let selection = Selection::hyperslab(vec![1, 3], vec![4, 4], vec![3, 3], vec![2, 1]).unwrap();
        let values = dataset.read_array::<i32>(&selection).await.unwrap();
        assert_eq!(values.shape(), &[6, 3]);
        let flat: Vec<i32> = values.iter().copied().collect();
        assert_eq!(flat[0], 17);
        assert_eq!(flat[17], 10 * 14 + 11);
    }
}

/// Zstandard chunks
#[tokio::test]
async fn test_zstd() {
    let pipeline = FilterPipeline::new(vec![FilterDescription::zstd(3)]);
    let file = filtered_file(Kind::FixedArray, pipeline.clone(), FileConfig::default(), &encoder(&pipeline));

    let dataset = file.dataset(NAME).await.unwrap();
    let values = dataset.read_array::<i32>(&Selection::All).await.unwrap();
    assert_eq!(values.iter().copied().collect::<Vec<_>>(), expected_all());
}

/// A set mask bit skips that filter for one chunk only
#[tokio::test]
async fn test_filter_mask_skips_filter() {
    let pipeline = FilterPipeline::new(vec![
        FilterDescription::shuffle(4),
        FilterDescription::deflate(6),
    ]);

    let registry = FilterRegistry::default();
    let encode = |scaled: &[u64], raw: Vec<u8>| {
        if scaled == [1, 1] {
            // stored shuffled but not compressed
            (shuffle(4, &raw), 1u32 << 1)
        } else {
            pipeline.encode(&registry, raw).expect("Failed to encode chunk")
        }
    };

    for kind in [Kind::BTree1, Kind::FixedArray, Kind::BTree2] {
        let file = filtered_file(kind, pipeline.clone(), FileConfig::default(), &encode);
        let dataset = file.dataset(NAME).await.unwrap();

        let values = dataset.read_array::<i32>(&Selection::All).await.unwrap();
        assert_eq!(
            values.iter().copied().collect::<Vec<_>>(),
            expected_all(),
            "index kind {:?}",
            kind
        );
    }
}

/// Scale-offset packed integers, with deflate on top
#[tokio::test]
async fn test_scale_offset() {
    let parameters = ScaleOffsetParameters::integer(20, 4, true);
    let pipeline = FilterPipeline::new(vec![
        FilterDescription::scale_offset(&parameters),
        FilterDescription::deflate(6),
    ]);

    for kind in [Kind::FixedArray, Kind::BTree2] {
        let file = filtered_file(kind, pipeline.clone(), FileConfig::default(), &encoder(&pipeline));
        let dataset = file.dataset(NAME).await.unwrap();

        let values = dataset.read_array::<i32>(&Selection::All).await.unwrap();
        assert_eq!(
            values.iter().copied().collect::<Vec<_>>(),
            expected_all(),
            "index kind {:?}",
            kind
        );
    }
}

/// N-bit chunks are recognised and rejected with a clear error
#[tokio::test]
async fn test_nbit_unsupported() {
    let stored = FilterPipeline::new(vec![FilterDescription::deflate(4)]);
    let declared = FilterPipeline::new(vec![
        FilterDescription::new(FILTER_NBIT, vec![]),
        FilterDescription::deflate(4),
    ]);

    let file = filtered_file(Kind::FixedArray, declared, FileConfig::default(), &encoder(&stored));
    let dataset = file.dataset(NAME).await.unwrap();

    let error = dataset.read_bytes(&Selection::All).await.unwrap_err();
    assert!(matches!(error, H5Error::UnsupportedFilter { id: FILTER_NBIT, .. }));
}

/// A required filter missing from the registry fails the read
#[tokio::test]
async fn test_unknown_required_filter() {
    let stored = FilterPipeline::new(vec![FilterDescription::deflate(4)]);
    let declared = FilterPipeline::new(vec![
        FilterDescription::deflate(4),
        FilterDescription::new(307, vec![9]).with_name("bzip2"),
    ]);

    let file = filtered_file(Kind::FixedArray, declared, FileConfig::default(), &encoder(&stored));
    let dataset = file.dataset(NAME).await.unwrap();

    let error = dataset.read_bytes(&Selection::All).await.unwrap_err();
    match error {
        H5Error::UnknownFilter { id, name } => {
            assert_eq!(id, 307);
            assert_eq!(name, "bzip2");
        }
        other => panic!("expected an unknown filter error, got {:?}", other),
    }
}

/// Optional filters missing from the registry are passed through
#[tokio::test]
async fn test_unknown_optional_filter() {
    let pipeline = FilterPipeline::new(vec![
        FilterDescription::shuffle(4),
        FilterDescription::new(307, vec![9]).optional(),
    ]);

    let file = filtered_file(Kind::BTree2, pipeline.clone(), FileConfig::default(), &encoder(&pipeline));
    let dataset = file.dataset(NAME).await.unwrap();

    let values = dataset.read_array::<i32>(&Selection::All).await.unwrap();
    assert_eq!(values.iter().copied().collect::<Vec<_>>(), expected_all());
}

/// User filters registered on the file config take part in decoding
#[tokio::test]
async fn test_registered_callback_filter() {
    const XOR_FILTER: u16 = 32100;

    let mut registry = FilterRegistry::default();
    registry.register(XOR_FILTER, "xor", |_, client_data, mut data| {
        let key = client_data.first().copied().unwrap_or(0) as u8;
        data.iter_mut().for_each(|b| *b ^= key);
        Ok(data)
    });

    let pipeline = FilterPipeline::new(vec![
        FilterDescription::deflate(1),
        FilterDescription::new(XOR_FILTER, vec![0x5a]),
    ]);
    let deflate_only = FilterPipeline::new(vec![FilterDescription::deflate(1)]);
    let default_registry = FilterRegistry::default();
    let encode = |_: &[u64], raw: Vec<u8>| {
        let (mut bytes, mask) = deflate_only
            .encode(&default_registry, raw)
            .expect("Failed to encode chunk");
        bytes.iter_mut().for_each(|b| *b ^= 0x5a);
        (bytes, mask)
    };

    let config = FileConfig::default().with_filters(registry);
    let file = filtered_file(Kind::FixedArray, pipeline, config, &encode);
    let dataset = file.dataset(NAME).await.unwrap();

    let values = dataset.read_array::<i32>(&Selection::All).await.unwrap();
    assert_eq!(values.iter().copied().collect::<Vec<_>>(), expected_all());
}

/// A corrupted chunk is caught by its Fletcher-32 trailer
#[tokio::test]
async fn test_fletcher32_detects_corruption() {
    let pipeline = FilterPipeline::new(vec![FilterDescription::fletcher32()]);
    let registry = FilterRegistry::default();
    let encode = |scaled: &[u64], raw: Vec<u8>| {
        let (mut bytes, mask) = pipeline.encode(&registry, raw).expect("Failed to encode chunk");
        if scaled == [0, 0] {
            bytes[3] ^= 0xff;
        }
        (bytes, mask)
    };

    let file = filtered_file(Kind::FixedArray, pipeline.clone(), FileConfig::default(), &encode);
    let dataset = file.dataset(NAME).await.unwrap();

    // chunk (0, 0) is corrupt, chunk (3, 2) is not
    let error = dataset
        .read_bytes(&Selection::points(vec![vec![0, 0]]).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(error, H5Error::ChecksumMismatch(_)));

    let values = dataset
        .read_array::<i32>(&Selection::points(vec![vec![13, 13]]).unwrap())
        .await
        .unwrap();
    assert_eq!(values.iter().copied().collect::<Vec<_>>(), vec![195]);
}

/// Deflate streams that do not inflate surface as decompression errors
#[tokio::test]
async fn test_corrupt_deflate_stream() {
    let pipeline = FilterPipeline::new(vec![FilterDescription::new(FILTER_DEFLATE, vec![6])]);
    let encode = |_: &[u64], raw: Vec<u8>| (raw, 0u32);

    let file = filtered_file(Kind::FixedArray, pipeline, FileConfig::default(), &encode);
    let dataset = file.dataset(NAME).await.unwrap();

    let error = dataset.read_bytes(&Selection::All).await.unwrap_err();
    assert!(matches!(error, H5Error::Decompression(_)));
}
