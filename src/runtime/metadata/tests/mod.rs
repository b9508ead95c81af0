//! 方法元数据单元测试

use super::*;

#[cfg(test)]
mod signature_tests {
    use super::*;

    #[test]
    fn test_parse_mixed() {
        let sig = Signature::parse("(I[JLjava/lang/String;D)Ljava/lang/Object;").unwrap();
        assert_eq!(
            sig.params(),
            &[
                BasicType::Int,
                BasicType::Array,
                BasicType::Object,
                BasicType::Double
            ]
        );
        assert_eq!(sig.return_type(), BasicType::Object);
        assert_eq!(sig.size(), 5);
    }

    #[test]
    fn test_parse_empty() {
        let sig = Signature::parse("()V").unwrap();
        assert!(sig.params().is_empty());
        assert_eq!(sig.size(), 0);
    }

    #[test]
    fn test_parse_malformed() {
        assert!(Signature::parse("I)V").is_err());
        assert!(Signature::parse("(Ljava/lang/Object)V").is_err());
        assert!(Signature::parse("(V)V").is_err());
        assert!(Signature::parse("(I)VV").is_err());
        assert!(Signature::parse("(Q)V").is_err());
    }
}

#[cfg(test)]
mod method_tests {
    use super::*;

    fn sample() -> Method {
        Method::builder(0x5000, "sample", Signature::parse("(IJ)V").unwrap())
            .code(0x40_0000, 32)
            .max_locals(2)
            .max_stack(4)
            .constants(0x6000)
            .method_data(MethodData {
                base: 0x7000,
                size: 256,
            })
            .invoke(
                8,
                InvokeSite {
                    signature: Signature::parse("(Ljava/lang/Object;)V").unwrap(),
                    has_receiver: true,
                    length: 3,
                },
            )
            .build()
    }

    #[test]
    fn test_parameters_include_receiver() {
        let m = sample();
        assert_eq!(m.size_of_parameters(), 4);
        assert_eq!(m.max_locals(), 4);
    }

    #[test]
    fn test_bcx_conversion() {
        let m = sample();
        assert_eq!(m.bcp_from(5), 0x40_0005);
        assert_eq!(m.bci_from(0x40_0005), Some(5));
        assert_eq!(m.bci_from(0x3f_ffff), None);
        assert_eq!(m.validate_bci_from_bcx(31), Some(31));
        assert_eq!(m.validate_bci_from_bcx(32), None);
        assert_eq!(m.validate_bci_from_bcx(0x40_001f), Some(31));
        assert_eq!(m.validate_bci_from_bcx(0x40_0020), None);
    }

    #[test]
    fn test_is_bci_boundary() {
        assert!(is_bci(0));
        assert!(is_bci(MAX_METHOD_CODE_SIZE));
        assert!(!is_bci(MAX_METHOD_CODE_SIZE + 1));
    }

    #[test]
    fn test_invoke_site() {
        let m = sample();
        let site = m.invoke_at(8).unwrap();
        assert_eq!(site.args_size(), 2);
        assert!(m.invoke_at(9).is_none());
    }

    #[test]
    fn test_method_data_conversion() {
        let data = MethodData {
            base: 0x7000,
            size: 256,
        };
        assert_eq!(data.di_to_dp(16), 0x7010);
        assert_eq!(data.dp_to_di(0x7010), Some(16));
        assert_eq!(data.dp_to_di(0x6fff), None);
        assert_eq!(data.dp_to_di(0x7101), None);
    }

    #[test]
    fn test_native_mask_from_signature() {
        let m = Method::builder(0x5008, "n", Signature::parse("(JLjava/lang/Object;)V").unwrap())
            .is_native()
            .build();
        let mask = m.mask_for(0).unwrap();
        assert_eq!(mask.local_count(), 4);
        assert_eq!(mask.oop_locals().collect::<Vec<_>>(), vec![0, 3]);
    }

    #[test]
    fn test_missing_mask() {
        assert!(sample().mask_for(3).is_none());
    }

    #[test]
    fn test_table_resolve() {
        let mut table = MethodTable::new();
        table.insert(sample());
        assert!(table.is_valid_method(0x5000));
        assert!(!table.is_valid_method(0x5008));
        assert_eq!(table.resolve(0x5000).unwrap().name(), "sample");
    }
}
