use crate::fusion::{debug, FusionPass};
use crate::graph::{Attribute, Graph, Initializer, Node, NodeIndex};

/// Which shape of the attention pattern a match resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttentionKind {
    /// One root input feeding q/k/v, unmasked scores
    EncoderSelf,
    /// One root input, mask added to the scores
    DecoderSelfWithMask,
    /// Separate root inputs for q and k/v
    DecoderCross,
}

/// Detects the exported attention subgraph (q/k/v projections, scaled
/// scores, softmax, context matmul, output reshape) behind a
/// SkipLayerNormalization anchor and collapses it into a single node.
///
/// Matching is conservative: any structural mismatch skips the anchor and
/// leaves the graph untouched. Mutations are planned during the scan and
/// committed once all anchors have been visited.
#[derive(Debug, Default)]
pub struct AttentionFusion {
    pub hidden_size: usize,
    pub num_heads: usize,
    nodes_to_add: Vec<Node>,
    nodes_to_remove: Vec<NodeIndex>,
    prune_graph: bool,
    fused: usize,
}

impl AttentionFusion {
    pub fn new(hidden_size: usize, num_heads: usize) -> Self {
        Self {
            hidden_size,
            num_heads,
            ..Default::default()
        }
    }

    /// Number of attention subgraphs collapsed by the last `apply`
    pub fn fused_count(&self) -> usize {
        self.fused
    }

    fn fuse(&mut self, normalize_node: NodeIndex, graph: &mut Graph) {
        // SkipLayerNormalization has two graph-carried inputs, one of them
        // is the root input for attention.
        let Some(qkv_nodes) = graph.match_parent_path(
            normalize_node,
            &["Add", "MatMul", "Reshape", "Transpose", "Reshape", "MatMul"],
            &[Some(1), Some(1), Some(0), Some(0), Some(0), Some(0)],
        ) else {
            return;
        };
        let add_out = qkv_nodes[0];
        let reshape_qkv_2 = qkv_nodes[2];
        let transpose_qkv = qkv_nodes[3];
        let reshape_qkv_1 = qkv_nodes[4];
        let matmul_qkv = qkv_nodes[5];

        let qkv_output = graph.node(add_out).outputs[0].clone();
        let mut other_inputs = vec![];
        for input in &graph.node(normalize_node).inputs {
            if graph.producer(input).is_none() {
                continue;
            }
            if *input == qkv_output {
                continue;
            }
            other_inputs.push(input.clone());
        }
        if other_inputs.len() != 1 {
            return;
        }
        let mut root_input = other_inputs.pop().unwrap();

        // The tensor feeding the attention MatMuls is not always the one the
        // anchor consumes. Hop to the normalization (or Add -> normalization)
        // producing it and take whichever of its outputs feeds a MatMul.
        let mut skip_layernorm = graph.producer(&root_input).unwrap();
        if graph.node(skip_layernorm).op_type == "Add" {
            let children = graph.get_children(skip_layernorm);
            let Some(&first) = children.first() else {
                return;
            };
            skip_layernorm = first;
        }
        for output in graph.node(skip_layernorm).outputs.clone() {
            if output.is_empty() {
                continue;
            }
            let children = graph.consumers_of(&output);
            if children
                .iter()
                .any(|&c| graph.node(c).op_type == "MatMul")
            {
                root_input = output;
                break;
            }
        }

        let Some(v_nodes) = graph.match_parent_path(
            matmul_qkv,
            &["Reshape", "Transpose", "Reshape", "Add", "MatMul"],
            &[Some(1), Some(0), Some(0), Some(0), None],
        ) else {
            if debug() {
                println!("attention fusion: failed to match v path");
            }
            return;
        };
        let reshape_v_2 = v_nodes[0];
        let add_v = v_nodes[3];
        let matmul_v = v_nodes[4];

        let qk_nodes_1 =
            graph.match_parent_path(matmul_qkv, &["Softmax", "MatMul"], &[Some(0), Some(0)]);
        let qk_nodes_2 = graph.match_parent_path(
            matmul_qkv,
            &["Softmax", "Reshape", "Add", "Reshape", "MatMul"],
            &[Some(0), Some(0), Some(0), Some(0), Some(0)],
        );
        let (qk_nodes, add_qk, masked_scores) = if let Some(path) = qk_nodes_1 {
            (path, None, false)
        } else if let Some(path) = qk_nodes_2 {
            let add_qk = path[2];
            (path, Some(add_qk), true)
        } else {
            return;
        };
        let matmul_qk = *qk_nodes.last().unwrap();

        let Some(q_nodes) = graph.match_parent_path(
            matmul_qk,
            &["Reshape", "Transpose", "Reshape", "Mul", "Add", "MatMul"],
            &[Some(0), Some(0), Some(0), Some(0), Some(0), Some(1)],
        ) else {
            return;
        };
        let reshape_q_2 = q_nodes[0];
        let reshape_q_1 = q_nodes[2];
        let add_q = q_nodes[4];
        let matmul_q = q_nodes[5];

        // K path shape depends on whether the projection carried a bias
        // before export
        let k_nodes_with_bias = graph.match_parent_path(
            matmul_qk,
            &["Transpose", "Reshape", "Transpose", "Reshape", "Add", "MatMul"],
            &[Some(1), Some(0), Some(0), Some(0), Some(0), Some(1)],
        );
        let k_nodes_no_bias = graph.match_parent_path(
            matmul_qk,
            &["Transpose", "Reshape", "Transpose", "Reshape", "MatMul"],
            &[Some(1), Some(0), Some(0), Some(0), Some(0)],
        );
        let (k_nodes, add_k, matmul_k) = if let Some(path) = k_nodes_with_bias {
            (path.clone(), Some(path[4]), path[5])
        } else if let Some(path) = k_nodes_no_bias {
            (path.clone(), None, path[4])
        } else {
            return;
        };
        let reshape_k_2 = k_nodes[1];

        let k_bias = match add_k {
            Some(add_k) => {
                let Some(bias) = initializer_input(graph, add_k) else {
                    return;
                };
                bias
            }
            None => {
                // The projection was exported without a bias, synthesize a
                // zero one so the packed bias stays rectangular
                let Some(v_bias) = initializer_input(graph, add_v) else {
                    return;
                };
                let bias_dim = graph.get_initializer(&v_bias).unwrap().dims[0];
                let name = free_initializer_name(graph, "empty_bias");
                graph.add_initializer(Initializer::zeros(name.clone(), bias_dim));
                name
            }
        };

        if !check_runtime_shape_path(
            graph,
            reshape_qkv_2,
            reshape_qkv_1,
            reshape_q_2,
            reshape_k_2,
            reshape_v_2,
            &root_input,
        ) {
            return;
        }

        let mq_in = graph.node(matmul_q).inputs[0].clone();
        let mk_in = graph.node(matmul_k).inputs[0].clone();
        let mv_in = graph.node(matmul_v).inputs[0].clone();
        let one_root_input = mq_in == root_input && mk_in == root_input && mv_in == root_input;
        let two_root_inputs = mq_in == root_input && mk_in == mv_in && mk_in != mq_in;

        let kind = if one_root_input && !masked_scores {
            AttentionKind::EncoderSelf
        } else if one_root_input && masked_scores {
            AttentionKind::DecoderSelfWithMask
        } else if two_root_inputs && !masked_scores {
            AttentionKind::DecoderCross
        } else {
            return;
        };

        // For masked decoder self-attention the mask tensor moves into the
        // fused node
        let mask_input = if kind == AttentionKind::DecoderSelfWithMask {
            let Some(mask_nodes) = graph.match_parent_path(
                add_qk.unwrap(),
                &["Expand", "Unsqueeze", "Unsqueeze", "Where"],
                &[Some(1), Some(0), Some(0), Some(0)],
            ) else {
                return;
            };
            Some(graph.node(mask_nodes[0]).outputs[0].clone())
        } else {
            None
        };

        let (num_heads, hidden_size) = self.num_heads_and_hidden_size(graph, reshape_q_1);
        if num_heads == 0 || hidden_size == 0 || hidden_size % num_heads != 0 {
            if debug() {
                println!("attention fusion: failed to detect num_heads or hidden_size");
            }
            return;
        }

        let attention_last_node = reshape_qkv_2;
        let output = graph.node(attention_last_node).outputs[0].clone();
        let new_node = match kind {
            AttentionKind::EncoderSelf | AttentionKind::DecoderSelfWithMask => self
                .create_attention_node(
                    graph,
                    matmul_q,
                    matmul_k,
                    matmul_v,
                    add_q,
                    &k_bias,
                    add_v,
                    num_heads,
                    hidden_size,
                    &root_input,
                    &output,
                    mask_input.as_deref(),
                ),
            AttentionKind::DecoderCross => self.create_multihead_attention_node(
                graph,
                matmul_q,
                matmul_k,
                matmul_v,
                add_q,
                &k_bias,
                add_v,
                num_heads,
                hidden_size,
                &output,
            ),
        };
        let Some(new_node) = new_node else {
            return;
        };

        self.nodes_to_add.push(new_node);
        self.nodes_to_remove
            .extend([attention_last_node, transpose_qkv, matmul_qkv]);
        self.nodes_to_remove.extend(qk_nodes);

        let (mut q_nodes, mut k_nodes, mut v_nodes) = (q_nodes, k_nodes, v_nodes);
        if kind == AttentionKind::DecoderCross {
            // The q/k/v projections stay in the graph and feed the fused
            // node directly
            q_nodes.pop();
            k_nodes.pop();
            v_nodes.pop();
        }
        self.nodes_to_remove.extend(q_nodes);
        self.nodes_to_remove.extend(k_nodes);
        self.nodes_to_remove.extend(v_nodes);

        // Shared shape/mask machinery is cleaned up by pruning once nothing
        // consumes it anymore
        self.prune_graph = true;
        self.fused += 1;
    }

    /// Read head count and hidden size from the constant shape of the first
    /// q reshape, `[_, _, num_heads, head_size]`. Falls back to the
    /// configured values when the shape is not constant.
    fn num_heads_and_hidden_size(&self, graph: &Graph, reshape_q: NodeIndex) -> (usize, usize) {
        let node = graph.node(reshape_q);
        let Some(shape_name) = node.inputs.get(1) else {
            return (self.num_heads, self.hidden_size);
        };
        let Some(q_shape) = graph.get_constant_value(shape_name) else {
            return (self.num_heads, self.hidden_size);
        };
        if q_shape.len() != 4 {
            return (self.num_heads, self.hidden_size);
        }
        let num_heads = q_shape[2] as usize;
        let head_size = q_shape[3] as usize;
        let hidden_size = num_heads * head_size;
        if self.num_heads > 0 && num_heads != self.num_heads && debug() {
            println!(
                "attention fusion: detected num_heads {num_heads} differs from configured {}",
                self.num_heads
            );
        }
        (num_heads, hidden_size)
    }

    /// Pack the q/k/v projections into a single node with combined weight
    /// and bias initializers.
    #[allow(clippy::too_many_arguments)]
    fn create_attention_node(
        &mut self,
        graph: &mut Graph,
        matmul_q: NodeIndex,
        matmul_k: NodeIndex,
        matmul_v: NodeIndex,
        add_q: NodeIndex,
        k_bias: &str,
        add_v: NodeIndex,
        num_heads: usize,
        hidden_size: usize,
        root_input: &str,
        output: &str,
        mask_input: Option<&str>,
    ) -> Option<Node> {
        let q_weight = initializer_input(graph, matmul_q)?;
        let k_weight = initializer_input(graph, matmul_k)?;
        let v_weight = initializer_input(graph, matmul_v)?;
        let q_bias = initializer_input(graph, add_q)?;
        let v_bias = initializer_input(graph, add_v)?;

        let name = graph.create_node_name("Attention");
        let weight_name = format!("{name}_qkv_weight");
        let qkv_weight = pack_weights(
            graph,
            &weight_name,
            &[&q_weight, &k_weight, &v_weight],
            hidden_size,
        )?;
        let bias_name = format!("{name}_qkv_bias");
        let qkv_bias = pack_biases(graph, &bias_name, &[&q_bias, k_bias, &v_bias], hidden_size)?;
        graph.add_initializer(qkv_weight);
        graph.add_initializer(qkv_bias);

        let mut inputs = vec![root_input.to_string(), weight_name, bias_name];
        if let Some(mask) = mask_input {
            inputs.push(mask.to_string());
        }
        Some(
            Node::new("Attention", name, inputs, vec![output.to_string()])
                .with_attribute("num_heads", Attribute::Int(num_heads as i64)),
        )
    }

    /// Cross-attention keeps the separate q/k/v projections; only the bias
    /// is packed.
    #[allow(clippy::too_many_arguments)]
    fn create_multihead_attention_node(
        &mut self,
        graph: &mut Graph,
        matmul_q: NodeIndex,
        matmul_k: NodeIndex,
        matmul_v: NodeIndex,
        add_q: NodeIndex,
        k_bias: &str,
        add_v: NodeIndex,
        num_heads: usize,
        hidden_size: usize,
        output: &str,
    ) -> Option<Node> {
        let q_bias = initializer_input(graph, add_q)?;
        let v_bias = initializer_input(graph, add_v)?;

        let name = graph.create_node_name("MultiHeadAttention");
        let bias_name = format!("{name}_qkv_bias");
        let qkv_bias = pack_biases(graph, &bias_name, &[&q_bias, k_bias, &v_bias], hidden_size)?;
        graph.add_initializer(qkv_bias);

        let query = graph.node(matmul_q).outputs[0].clone();
        let key = graph.node(matmul_k).outputs[0].clone();
        let value = graph.node(matmul_v).outputs[0].clone();
        Some(
            Node::new(
                "MultiHeadAttention",
                name,
                vec![query, key, value, bias_name],
                vec![output.to_string()],
            )
            .with_attribute("num_heads", Attribute::Int(num_heads as i64)),
        )
    }
}

impl FusionPass for AttentionFusion {
    fn apply(&mut self, graph: &mut Graph) {
        self.fused = 0;
        for anchor in graph.op_nodes("SkipLayerNormalization") {
            self.fuse(anchor, graph);
        }
        for node in std::mem::take(&mut self.nodes_to_add) {
            graph.add_node(node);
        }
        let remove = std::mem::take(&mut self.nodes_to_remove);
        graph.remove_nodes(&remove);
        if std::mem::take(&mut self.prune_graph) {
            graph.prune();
        }
    }
}

/// The first input of `node` that is backed by an initializer
fn initializer_input(graph: &Graph, node: NodeIndex) -> Option<String> {
    graph
        .node(node)
        .inputs
        .iter()
        .find(|i| graph.get_initializer(i).is_some())
        .cloned()
}

fn free_initializer_name(graph: &Graph, prefix: &str) -> String {
    if graph.get_initializer(prefix).is_none() {
        return prefix.to_string();
    }
    let mut i = 1;
    loop {
        let name = format!("{prefix}_{i}");
        if graph.get_initializer(&name).is_none() {
            return name;
        }
        i += 1;
    }
}

/// Interleave `[hidden, hidden]` projection weights into `[hidden, 3*hidden]`
fn pack_weights(
    graph: &Graph,
    name: &str,
    parts: &[&str; 3],
    hidden_size: usize,
) -> Option<Initializer> {
    let mut data = Vec::with_capacity(hidden_size * 3 * hidden_size);
    let weights = parts
        .iter()
        .map(|p| graph.get_initializer(p))
        .collect::<Option<Vec<_>>>()?;
    for w in &weights {
        if w.dims != [hidden_size, hidden_size] {
            return None;
        }
    }
    for row in 0..hidden_size {
        for w in &weights {
            data.extend_from_slice(&w.data[row * hidden_size..(row + 1) * hidden_size]);
        }
    }
    Some(Initializer::new(
        name,
        vec![hidden_size, 3 * hidden_size],
        data,
    ))
}

fn pack_biases(
    graph: &Graph,
    name: &str,
    parts: &[&str; 3],
    hidden_size: usize,
) -> Option<Initializer> {
    let mut data = Vec::with_capacity(3 * hidden_size);
    for part in parts {
        let bias = graph.get_initializer(part)?;
        if bias.dims != [hidden_size] {
            return None;
        }
        data.extend_from_slice(&bias.data);
    }
    Some(Initializer::new(name, vec![3 * hidden_size], data))
}

/// The exported graphs compute reshape targets at runtime from the root
/// input's shape. Verify the Concat/Unsqueeze/Gather/Shape machinery hangs
/// off the same root before trusting the match.
fn check_runtime_shape_path(
    graph: &Graph,
    reshape_qkv_2: NodeIndex,
    reshape_qkv_1: NodeIndex,
    reshape_q_2: NodeIndex,
    reshape_k_2: NodeIndex,
    reshape_v_2: NodeIndex,
    root_input: &str,
) -> bool {
    let Some(concat_qkv_2_path) = graph.match_parent_path(reshape_qkv_2, &["Concat"], &[Some(1)])
    else {
        return false;
    };
    let concat_qkv_2 = concat_qkv_2_path[0];

    let path_1 = graph.match_parent_path(
        concat_qkv_2,
        &["Unsqueeze", "Gather", "Shape"],
        &[Some(0), Some(0), Some(0)],
    );
    let path_2 = graph.match_parent_path(
        concat_qkv_2,
        &["Unsqueeze", "Gather", "Shape"],
        &[Some(1), Some(0), Some(0)],
    );
    let (Some(path_1), Some(path_2)) = (path_1, path_2) else {
        return false;
    };
    let (gather_1, shape_1) = (path_1[1], path_1[2]);
    let (gather_2, shape_2) = (path_2[1], path_2[2]);
    if graph.node(shape_1).inputs[0] != root_input || graph.node(shape_2).inputs[0] != root_input {
        return false;
    }

    let qkv_1_path_1 = graph.match_parent_path(
        reshape_qkv_1,
        &["Concat", "Unsqueeze", "Gather"],
        &[Some(1), Some(0), Some(0)],
    );
    let qkv_1_path_2 = graph.match_parent_path(
        reshape_qkv_1,
        &["Concat", "Unsqueeze", "Gather"],
        &[Some(1), Some(2), Some(0)],
    );
    let (Some(qkv_1_path_1), Some(qkv_1_path_2)) = (qkv_1_path_1, qkv_1_path_2) else {
        return false;
    };
    if graph.node(*qkv_1_path_1.last().unwrap()).name != graph.node(gather_1).name
        || graph.node(*qkv_1_path_2.last().unwrap()).name != graph.node(gather_2).name
    {
        return false;
    }

    let gather_1_out = graph.node(gather_1).outputs[0].clone();
    for reshape in [reshape_q_2, reshape_k_2, reshape_v_2] {
        let Some(path) = graph.match_parent_path(
            reshape,
            &["Concat", "Unsqueeze", "Mul"],
            &[Some(1), Some(0), Some(0)],
        ) else {
            return false;
        };
        let mul = *path.last().unwrap();
        if graph.node(mul).inputs[0] != gather_1_out {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, Initializer, Node};

    const HIDDEN: usize = 32;
    const HEADS: usize = 4;
    const HEAD_SIZE: usize = 8;

    enum Variant {
        Encoder,
        Decoder,
        Cross,
        BrokenQ,
    }

    /// Build the exported attention subgraph around a pair of
    /// SkipLayerNormalization nodes, mirroring what the exporter emits for
    /// each variant.
    fn build_graph(variant: Variant) -> Graph {
        let mut g = Graph::new();
        g.add_input("input_0");
        g.add_output("out_0");

        for (name, dims) in [
            ("q_w", vec![HIDDEN, HIDDEN]),
            ("k_w", vec![HIDDEN, HIDDEN]),
            ("v_w", vec![HIDDEN, HIDDEN]),
            ("out_w", vec![HIDDEN, HIDDEN]),
        ] {
            let len = dims.iter().product();
            g.add_initializer(Initializer::new(name, dims, vec![0.01; len]));
        }
        for name in ["q_bias", "v_bias", "out_bias", "ln_w", "ln2_w"] {
            g.add_initializer(Initializer::new(name, vec![HIDDEN], vec![0.1; HIDDEN]));
        }
        if !matches!(variant, Variant::Cross) {
            g.add_initializer(Initializer::new("k_bias", vec![HIDDEN], vec![0.1; HIDDEN]));
        }
        g.add_initializer(Initializer::new(
            "qkv_shape",
            vec![4],
            vec![0., 0., HEADS as f32, HEAD_SIZE as f32],
        ));
        g.add_initializer(Initializer::new("g_idx0", vec![], vec![0.]));
        g.add_initializer(Initializer::new("g_idx1", vec![], vec![1.]));
        g.add_initializer(Initializer::new("heads_init", vec![1], vec![HEADS as f32]));
        g.add_initializer(Initializer::new("heads_mul", vec![1], vec![HEADS as f32]));
        g.add_initializer(Initializer::new("minus1", vec![1], vec![-1.]));
        g.add_initializer(Initializer::new(
            "headsz",
            vec![1],
            vec![HEAD_SIZE as f32],
        ));
        g.add_initializer(Initializer::new("hid_init", vec![1], vec![HIDDEN as f32]));
        g.add_initializer(Initializer::new("q_scale", vec![], vec![0.125]));
        g.add_initializer(Initializer::new("shape_a", vec![3], vec![0., 0., 0.]));
        g.add_initializer(Initializer::new("shape_b", vec![4], vec![0., 0., 0., 0.]));
        g.add_initializer(Initializer::new("exp_shape", vec![4], vec![0., 0., 0., 0.]));

        let kv_root = if matches!(variant, Variant::Cross) {
            g.add_input("enc");
            "enc"
        } else {
            "root"
        };

        g.add_node(Node::new(
            "SkipLayerNormalization",
            "sln_0",
            ["input_0", "ln_w"],
            ["root"],
        ));

        // Q projection
        g.add_node(Node::new("MatMul", "matmul_q", ["root", "q_w"], ["mq"]));
        g.add_node(Node::new("Add", "add_q", ["q_bias", "mq"], ["aq"]));
        let q_scale_op = if matches!(variant, Variant::BrokenQ) {
            "Div"
        } else {
            "Mul"
        };
        g.add_node(Node::new(q_scale_op, "mul_q", ["aq", "q_scale"], ["mulq"]));
        g.add_node(Node::new(
            "Reshape",
            "reshape_q_1",
            ["mulq", "qkv_shape"],
            ["rq1"],
        ));
        g.add_node(Node::new("Transpose", "transpose_q", ["rq1"], ["tq"]));
        g.add_node(Node::new(
            "Reshape",
            "reshape_q_2",
            ["tq", "shape_q2"],
            ["rq2"],
        ));

        // K projection; cross attention is exported without a k bias
        g.add_node(Node::new("MatMul", "matmul_k", [kv_root, "k_w"], ["mk"]));
        let k_reshape_in = if matches!(variant, Variant::Cross) {
            "mk"
        } else {
            g.add_node(Node::new("Add", "add_k", ["k_bias", "mk"], ["ak"]));
            "ak"
        };
        g.add_node(Node::new(
            "Reshape",
            "reshape_k_1",
            [k_reshape_in, "qkv_shape"],
            ["rk1"],
        ));
        g.add_node(Node::new("Transpose", "transpose_k", ["rk1"], ["tk"]));
        g.add_node(Node::new(
            "Reshape",
            "reshape_k_2",
            ["tk", "shape_q2"],
            ["rk2"],
        ));
        g.add_node(Node::new("Transpose", "transpose_k_2", ["rk2"], ["tk2"]));

        // V projection
        g.add_node(Node::new("MatMul", "matmul_v", [kv_root, "v_w"], ["mv"]));
        g.add_node(Node::new("Add", "add_v", ["v_bias", "mv"], ["av"]));
        g.add_node(Node::new(
            "Reshape",
            "reshape_v_1",
            ["av", "qkv_shape"],
            ["rv1"],
        ));
        g.add_node(Node::new("Transpose", "transpose_v", ["rv1"], ["tv"]));
        g.add_node(Node::new(
            "Reshape",
            "reshape_v_2",
            ["tv", "shape_q2"],
            ["rv2"],
        ));

        // Scores
        g.add_node(Node::new("MatMul", "matmul_qk", ["rq2", "tk2"], ["qk"]));
        if matches!(variant, Variant::Decoder) {
            g.add_node(Node::new("Where", "where_m", ["cond", "wx", "wy"], ["wh"]));
            g.add_node(Node::new("Unsqueeze", "unsq_m1", ["wh"], ["um1"]));
            g.add_node(Node::new("Unsqueeze", "unsq_m2", ["um1"], ["um2"]));
            g.add_node(Node::new(
                "Expand",
                "expand_m",
                ["um2", "exp_shape"],
                ["mask_exp"],
            ));
            g.add_node(Node::new(
                "Reshape",
                "reshape_pre",
                ["qk", "shape_a"],
                ["qkr"],
            ));
            g.add_node(Node::new("Add", "add_qk", ["qkr", "mask_exp"], ["qkm"]));
            g.add_node(Node::new(
                "Reshape",
                "reshape_post",
                ["qkm", "shape_b"],
                ["qkm2"],
            ));
            g.add_node(Node::new("Softmax", "softmax", ["qkm2"], ["probs"]));
        } else {
            g.add_node(Node::new("Softmax", "softmax", ["qk"], ["probs"]));
        }
        g.add_node(Node::new(
            "MatMul",
            "matmul_qkv",
            ["probs", "rv2"],
            ["ctx"],
        ));

        // Output reshape and projection
        g.add_node(Node::new(
            "Reshape",
            "reshape_qkv_1",
            ["ctx", "shape_qkv_1"],
            ["rqkv1"],
        ));
        g.add_node(Node::new(
            "Transpose",
            "transpose_qkv",
            ["rqkv1"],
            ["tqkv"],
        ));
        g.add_node(Node::new(
            "Reshape",
            "reshape_qkv_2",
            ["tqkv", "shape_qkv_2"],
            ["attn_out"],
        ));
        g.add_node(Node::new(
            "MatMul",
            "matmul_out",
            ["attn_out", "out_w"],
            ["mo"],
        ));
        g.add_node(Node::new("Add", "add_out", ["out_bias", "mo"], ["ao"]));
        g.add_node(Node::new(
            "SkipLayerNormalization",
            "normalize",
            ["root", "ao", "ln2_w"],
            ["out_0"],
        ));

        // Runtime shape machinery hanging off the root input
        g.add_node(Node::new("Shape", "shape_1", ["root"], ["shp1"]));
        g.add_node(Node::new("Gather", "gather_1", ["shp1", "g_idx0"], ["g1"]));
        g.add_node(Node::new("Shape", "shape_2", ["root"], ["shp2"]));
        g.add_node(Node::new("Gather", "gather_2", ["shp2", "g_idx1"], ["g2"]));
        g.add_node(Node::new("Unsqueeze", "unsq_a", ["g1"], ["u_a"]));
        g.add_node(Node::new("Unsqueeze", "unsq_b", ["g2"], ["u_b"]));
        g.add_node(Node::new(
            "Concat",
            "concat_qkv_2",
            ["u_a", "u_b", "hid_init"],
            ["shape_qkv_2"],
        ));
        g.add_node(Node::new("Unsqueeze", "unsq_c", ["g1"], ["u_c"]));
        g.add_node(Node::new("Unsqueeze", "unsq_d", ["g2"], ["u_d"]));
        g.add_node(Node::new(
            "Concat",
            "concat_qkv_1",
            ["u_c", "heads_init", "u_d"],
            ["shape_qkv_1"],
        ));
        g.add_node(Node::new("Mul", "mul_bh", ["g1", "heads_mul"], ["bh"]));
        g.add_node(Node::new("Unsqueeze", "unsq_e", ["bh"], ["u_e"]));
        g.add_node(Node::new(
            "Concat",
            "concat_q2",
            ["u_e", "minus1", "headsz"],
            ["shape_q2"],
        ));

        g
    }

    #[test]
    fn test_encoder_attention_fusion() {
        let mut g = build_graph(Variant::Encoder);
        let mut pass = AttentionFusion::new(HIDDEN, HEADS);
        pass.apply(&mut g);

        assert_eq!(pass.fused_count(), 1);
        assert_eq!(g.count_op("Attention"), 1);
        assert_eq!(g.count_op("Softmax"), 0);
        // Only the output projection MatMul survives
        assert_eq!(g.count_op("MatMul"), 1);
        // sln_0, Attention, matmul_out, add_out, normalize
        assert_eq!(g.node_count(), 5);

        let attention = g.op_nodes("Attention")[0];
        let node = g.node(attention);
        assert_eq!(node.inputs[0], "root");
        assert_eq!(node.outputs[0], "attn_out");
        assert_eq!(node.attribute_int("num_heads"), Some(HEADS as i64));

        let weight = g.get_initializer("Attention_0_qkv_weight").unwrap();
        assert_eq!(weight.dims, vec![HIDDEN, 3 * HIDDEN]);
        let bias = g.get_initializer("Attention_0_qkv_bias").unwrap();
        assert_eq!(bias.dims, vec![3 * HIDDEN]);
    }

    #[test]
    fn test_fusion_is_idempotent() {
        let mut g = build_graph(Variant::Encoder);
        let mut pass = AttentionFusion::new(HIDDEN, HEADS);
        pass.apply(&mut g);
        let nodes_after_first = g.node_count();

        pass.apply(&mut g);
        assert_eq!(pass.fused_count(), 0);
        assert_eq!(g.node_count(), nodes_after_first);
        assert_eq!(g.count_op("Attention"), 1);
    }

    #[test]
    fn test_decoder_attention_gets_mask() {
        let mut g = build_graph(Variant::Decoder);
        let mut pass = AttentionFusion::new(HIDDEN, HEADS);
        pass.apply(&mut g);

        assert_eq!(pass.fused_count(), 1);
        assert_eq!(g.count_op("Attention"), 1);
        let attention = g.op_nodes("Attention")[0];
        let node = g.node(attention);
        assert_eq!(node.inputs.len(), 4);
        assert_eq!(node.inputs[3], "mask_exp");
        // The mask machinery feeds the fused node and stays alive
        assert_eq!(g.count_op("Where"), 1);
        assert_eq!(g.count_op("Expand"), 1);
    }

    #[test]
    fn test_cross_attention_keeps_projections() {
        let mut g = build_graph(Variant::Cross);
        let mut pass = AttentionFusion::new(HIDDEN, HEADS);
        pass.apply(&mut g);

        assert_eq!(pass.fused_count(), 1);
        assert_eq!(g.count_op("MultiHeadAttention"), 1);
        assert_eq!(g.count_op("Attention"), 0);
        // q/k/v projections plus the output projection stay
        assert_eq!(g.count_op("MatMul"), 4);

        let mha = g.op_nodes("MultiHeadAttention")[0];
        let node = g.node(mha);
        assert_eq!(node.inputs[..3], ["mq", "mk", "mv"]);

        // The bias-less k path got a synthesized zero bias in the packed
        // initializer
        assert!(g.get_initializer("empty_bias").is_some());
        let bias = g
            .get_initializer("MultiHeadAttention_0_qkv_bias")
            .unwrap();
        assert_eq!(bias.dims, vec![3 * HIDDEN]);
        assert!(bias.data[HIDDEN..2 * HIDDEN].iter().all(|b| *b == 0.0));
        assert!(bias.data[..HIDDEN].iter().all(|b| *b == 0.1));
    }

    #[test]
    fn test_broken_pattern_leaves_graph_untouched() {
        let mut g = build_graph(Variant::BrokenQ);
        let before = g.node_count();
        let mut pass = AttentionFusion::new(HIDDEN, HEADS);
        pass.apply(&mut g);

        assert_eq!(pass.fused_count(), 0);
        assert_eq!(g.count_op("Attention"), 0);
        assert_eq!(g.node_count(), before);
    }

    #[test]
    fn test_detects_heads_from_reshape_constant() {
        let mut g = build_graph(Variant::Encoder);
        // Configured values are wrong on purpose; the constant shape wins
        let mut pass = AttentionFusion::new(0, 0);
        pass.apply(&mut g);

        assert_eq!(pass.fused_count(), 1);
        let attention = g.op_nodes("Attention")[0];
        assert_eq!(
            g.node(attention).attribute_int("num_heads"),
            Some(HEADS as i64)
        );
    }
}
