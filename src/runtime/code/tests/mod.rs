//! 代码区注册表单元测试

use super::*;

fn compiled(
    name: &str,
    start: Address,
) -> CodeBlob {
    CodeBlob::new(
        name,
        start,
        start + 0x100,
        BlobKind::Compiled(CompiledMethod::new(0x5000, start + 0xf0, start + 0xf8)),
    )
    .with_frame_size(4)
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    #[test]
    fn test_find_by_pc() {
        let mut cache = CodeCache::new();
        cache
            .insert(CodeBlob::new("interp", 0x1000, 0x2000, BlobKind::Interpreter))
            .unwrap();
        cache.insert(compiled("m", 0x3000)).unwrap();

        assert_eq!(cache.find(0x1000).map(CodeBlob::name), Some("interp"));
        assert_eq!(cache.find(0x1fff).map(CodeBlob::name), Some("interp"));
        assert!(cache.find(0x2000).is_none());
        assert_eq!(cache.find(0x3010).map(CodeBlob::name), Some("m"));
        assert!(cache.interpreter_contains(0x1800));
        assert!(!cache.interpreter_contains(0x3010));
        assert!(!cache.contains(0));
        assert!(!cache.contains(usize::MAX));
    }

    #[test]
    fn test_overlap_rejected() {
        let mut cache = CodeCache::new();
        cache.insert(compiled("a", 0x3000)).unwrap();
        let err = cache.insert(compiled("b", 0x3080)).unwrap_err();
        assert!(matches!(err, CodeCacheError::Overlap { ref other, .. } if other == "a"));
        cache.insert(compiled("c", 0x3100)).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_call_stub_return() {
        let mut cache = CodeCache::new();
        cache
            .insert(CodeBlob::new(
                "call_stub",
                0x800,
                0x900,
                BlobKind::CallStub { return_pc: 0x840 },
            ))
            .unwrap();
        assert!(cache.returns_to_call_stub(0x840));
        assert!(!cache.returns_to_call_stub(0x844));
    }

    #[test]
    fn test_empty_range_rejected() {
        let mut cache = CodeCache::new();
        let err = cache
            .insert(CodeBlob::new("empty", 0x10, 0x10, BlobKind::RuntimeStub))
            .unwrap_err();
        assert!(matches!(err, CodeCacheError::EmptyRange { .. }));
    }
}

#[cfg(test)]
mod compiled_method_tests {
    use super::*;

    #[test]
    fn test_ambiguous_return_pc_rejected() {
        let nm = CompiledMethod::new(0x5000, 0x30f0, 0x30f8).with_method_handle_return(0x30f0);
        let blob = CodeBlob::new("m", 0x3000, 0x3100, BlobKind::Compiled(nm)).with_frame_size(4);
        let err = CodeCache::new().insert(blob).unwrap_err();
        assert_eq!(
            err,
            CodeCacheError::AmbiguousReturnPc {
                name: "m".into(),
                pc: 0x30f0
            }
        );
    }

    #[test]
    fn test_handler_outside_blob_rejected() {
        let nm = CompiledMethod::new(0x5000, 0x9000, 0x30f8);
        let blob = CodeBlob::new("m", 0x3000, 0x3100, BlobKind::Compiled(nm));
        let err = CodeCache::new().insert(blob).unwrap_err();
        assert!(matches!(err, CodeCacheError::OutsideBlob { pc: 0x9000, .. }));
    }

    #[test]
    fn test_original_pc_table() {
        let nm = CompiledMethod::new(0x5000, 0x30f0, 0x30f8);
        assert_eq!(nm.original_pc(0x100), None);
        nm.set_original_pc(0x100, 0x3020);
        nm.set_original_pc(0x100, 0x3020);
        assert_eq!(nm.original_pc(0x100), Some(0x3020));
        assert_eq!(nm.original_pc_count(), 1);
        assert_eq!(nm.forget_original_pc(0x100), Some(0x3020));
        assert_eq!(nm.original_pc_count(), 0);
    }

    #[test]
    fn test_pc_categories() {
        let nm = CompiledMethod::new(0x5000, 0x30f0, 0x30f8)
            .with_poll_return(0x30e0)
            .with_method_handle_return(0x3040);
        assert!(nm.is_deopt_pc(0x30f0));
        assert!(nm.is_deopt_mh_entry(0x30f8));
        assert!(nm.is_at_poll_return(0x30e0));
        assert!(nm.is_method_handle_return(0x3040));
        assert!(!nm.is_marked_for_deoptimization());
        nm.mark_for_deoptimization();
        assert!(nm.is_marked_for_deoptimization());
    }

    #[test]
    fn test_frame_complete() {
        let blob = compiled("m", 0x3000).with_frame_complete_offset(0x10);
        assert!(!blob.is_frame_complete_at(0x3008));
        assert!(blob.is_frame_complete_at(0x3010));
        let adapter = CodeBlob::new("i2c", 0x4000, 0x4100, BlobKind::Adapter);
        assert!(!adapter.is_frame_complete_at(0x4080));
    }

    #[test]
    fn test_oop_map_lookup_by_pc() {
        let blob = compiled("m", 0x3000).with_oop_maps(OopMapSet::new(vec![OopMap::at(0x20)]));
        assert!(blob.oop_map_at(0x3020).is_some());
        assert!(blob.oop_map_at(0x3021).is_none());
        assert!(blob.oop_map_at(0x2000).is_none());
    }
}
