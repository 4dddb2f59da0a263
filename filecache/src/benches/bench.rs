use criterion::criterion_main;


criterion_main!(hit::benches, miss::benches);
