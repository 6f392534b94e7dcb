use criterion::{black_box, criterion_group, criterion_main, Criterion};

use nyx_runtime::{ObjRef, Runtime};

fn bench_force_free(c: &mut Criterion) {
    c.bench_function("force_free_string", |b| {
        let mut rt = Runtime::new();
        b.iter(|| {
            let s = rt.new_string(black_box("benchmark payload"));
            rt.force_free(s).unwrap();
        });
    });

    c.bench_function("force_free_object_embedded_attrs", |b| {
        let mut rt = Runtime::new();
        let class = rt.new_class(rt.core().object);
        b.iter(|| {
            let obj = rt.new_object(black_box(class));
            rt.force_free(obj).unwrap();
        });
    });

    c.bench_function("force_free_all_batch_of_64", |b| {
        let mut rt = Runtime::new();
        b.iter(|| {
            let batch: Vec<ObjRef> = (0..64).map(|i| rt.new_array(vec![ObjRef::from_fixnum(i)])).collect();
            rt.force_free_all(black_box(&batch)).unwrap();
        });
    });
}

criterion_group!(benches, bench_force_free);
criterion_main!(benches);
