use tch::{nn, nn::ModuleT, Tensor};

/// (in, out, kernel, stride, padding, pool) for the five AlexNet conv stages.
const STAGES: [(i64, i64, i64, i64, i64, bool); 5] = [
    (3, 64, 11, 4, 2, true),
    (64, 192, 5, 1, 2, true),
    (192, 384, 3, 1, 1, false),
    (384, 256, 3, 1, 1, false),
    (256, 256, 3, 1, 1, true),
];

/// Position of each stage's conv inside torchvision's `alexnet().features`.
const FEATURE_CONV_INDEX: [usize; 5] = [0, 3, 6, 8, 10];

/// Linear layers inside `classifier`.
const CLASSIFIER_LINEAR_INDEX: [usize; 3] = [1, 4, 6];

const FLAT_FEATURES: i64 = 256 * 6 * 6;
const HIDDEN: i64 = 4096;
const DROPOUT: f64 = 0.5;

pub const NUM_STAGES: usize = STAGES.len();

/// `featuresN1` holds the original conv block of stage N, `featuresN2` the inserted 1x1.
pub fn group_name(stage: usize, inserted: bool) -> String {
    format!("features{}{}", stage + 1, if inserted { 2 } else { 1 })
}

/// Weight names of the five inserted depthwise layers.
pub fn inserted_weight_names() -> Vec<String> {
    (0..NUM_STAGES)
        .map(|s| format!("{}.0.weight", group_name(s, true)))
        .collect()
}

pub fn is_inserted_param(name: &str) -> bool {
    group_of(name).is_some_and(|g| g.starts_with("features") && g.ends_with('2'))
}

pub fn is_frozen_param(name: &str) -> bool {
    group_of(name).is_some_and(|g| g.starts_with("features") && g.ends_with('1'))
}

fn group_of(name: &str) -> Option<&str> {
    name.split('.').next()
}

/// Pairs of (own name, torchvision alexnet name) for every pretrained tensor.
pub fn pretrained_name_map() -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(16);
    for (stage, idx) in FEATURE_CONV_INDEX.iter().enumerate() {
        for kind in ["weight", "bias"] {
            pairs.push((
                format!("{}.0.{kind}", group_name(stage, false)),
                format!("features.{idx}.{kind}"),
            ));
        }
    }
    for idx in CLASSIFIER_LINEAR_INDEX {
        for kind in ["weight", "bias"] {
            let name = format!("classifier.{idx}.{kind}");
            pairs.push((name.clone(), name));
        }
    }
    pairs
}

fn max_pool(x: &Tensor) -> Tensor {
    x.max_pool2d(&[3, 3], &[2, 2], &[0, 0], &[1, 1], false)
}

fn conv_block(vs: &nn::Path, stage: usize) -> nn::SequentialT {
    let (in_c, out_c, k, stride, padding, pool) = STAGES[stage];
    let mut seq = nn::seq_t()
        .add(nn::conv2d(
            &vs.sub("0"),
            in_c,
            out_c,
            k,
            nn::ConvConfig { stride, padding, ..Default::default() },
        ))
        .add_fn(|x| x.relu());
    if pool {
        seq = seq.add_fn(max_pool);
    }
    seq
}

/// Per-channel scaling: a 1x1 conv with one group per channel, no bias,
/// starting at ones so a fresh layer is the identity.
fn depthwise_1x1(vs: &nn::Path, channels: i64) -> nn::SequentialT {
    nn::seq_t().add(nn::conv2d(
        &vs.sub("0"),
        channels,
        channels,
        1,
        nn::ConvConfig {
            groups: channels,
            bias: false,
            ws_init: nn::Init::Const(1.0),
            ..Default::default()
        },
    ))
}

fn classifier(vs: &nn::Path, num_classes: i64) -> nn::SequentialT {
    nn::seq_t()
        .add_fn_t(|x, train| x.dropout(DROPOUT, train))
        .add(nn::linear(vs.sub("1"), FLAT_FEATURES, HIDDEN, Default::default()))
        .add_fn(|x| x.relu())
        .add_fn_t(|x, train| x.dropout(DROPOUT, train))
        .add(nn::linear(vs.sub("4"), HIDDEN, HIDDEN, Default::default()))
        .add_fn(|x| x.relu())
        .add(nn::linear(vs.sub("6"), HIDDEN, num_classes, Default::default()))
}

/// AlexNet with a depthwise 1x1 conv after each of its five conv stages.
#[derive(Debug)]
pub struct AddLayerAlexNet {
    groups: Vec<(nn::SequentialT, nn::SequentialT)>,
    classifier: nn::SequentialT,
    num_classes: i64,
}

impl AddLayerAlexNet {
    pub fn new(vs: &nn::Path, num_classes: i64) -> Self {
        let groups = (0..NUM_STAGES)
            .map(|stage| {
                let channels = STAGES[stage].1;
                let original = conv_block(&vs.sub(group_name(stage, false)), stage);
                let inserted = depthwise_1x1(&vs.sub(group_name(stage, true)), channels);
                (original, inserted)
            })
            .collect();
        let classifier = classifier(&vs.sub("classifier"), num_classes);
        Self { groups, classifier, num_classes }
    }

    pub fn num_classes(&self) -> i64 {
        self.num_classes
    }
}

impl nn::ModuleT for AddLayerAlexNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut x = xs.shallow_clone();
        for (original, inserted) in &self.groups {
            x = original.forward_t(&x, train);
            x = inserted.forward_t(&x, train);
        }
        self.classifier.forward_t(&x.flatten(1, -1), train)
    }
}

/// Stops gradients for every original conv block; returns how many tensors were frozen.
pub fn freeze_original(vs: &nn::VarStore) -> usize {
    let mut frozen = 0usize;
    for (name, var) in vs.variables().iter() {
        if is_frozen_param(name) {
            let _ = var.set_requires_grad(false);
            frozen += 1;
        }
    }
    frozen
}
