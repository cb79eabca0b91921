//! EfficientNet-B0 特徴抽出器
//!
//! 分類ヘッドを持たないバックボーン。出力は `[batch, 1280, h, w]`。
//!
//! # アーキテクチャ
//! - Stem: Conv 3x3 stride 2 (32ch) + BN + SiLU
//! - MBConv x 16（7ステージ）
//! - Head: Conv 1x1 (1280ch) + BN + SiLU
//!
//! 凍結はユニット単位（Stem, 各MBConv, Head の計18個）で行います。
//! 凍結ユニットは重みも BatchNorm の移動統計も変化しません。

use burn::{
    module::{AutodiffModule, Module},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    tensor::{
        activation::{sigmoid, silu},
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
};
use std::ops::Range;

/// バックボーンの出力チャネル数
pub const FEATURE_CHANNELS: usize = 1280;

/// Stem の出力チャネル数
const STEM_CHANNELS: usize = 32;

/// Squeeze-and-Excitation の縮小率（ブロック入力チャネル基準）
const SE_RATIO: f64 = 0.25;

/// ステージ定義: (拡張率, カーネル, ストライド, 出力チャネル, 繰り返し数)
const STAGES: [(usize, usize, usize, usize, usize); 7] = [
    (1, 3, 1, 16, 1),
    (6, 3, 2, 24, 2),
    (6, 5, 2, 40, 2),
    (6, 3, 2, 80, 3),
    (6, 5, 1, 112, 3),
    (6, 5, 2, 192, 4),
    (6, 3, 1, 320, 1),
];

/// MBConv ブロックの総数
pub const NUM_BLOCKS: usize = 16;

/// 凍結単位の総数（Stem + MBConv + Head）
pub const NUM_UNITS: usize = NUM_BLOCKS + 2;

/// Conv + BatchNorm（バイアスなし）
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> ConvBn<B> {
    fn new(
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let padding = kernel / 2;
        Self {
            conv: Conv2dConfig::new(channels, [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_groups(groups)
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(channels[1])
                .with_epsilon(1e-3)
                .with_momentum(0.01)
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// Squeeze-and-Excitation
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    pool: AdaptiveAvgPool2d,
    reduce: Conv2d<B>,
    expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcite<B> {
    fn new(channels: usize, reduced: usize, device: &B::Device) -> Self {
        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            reduce: Conv2dConfig::new([channels, reduced], [1, 1]).init(device),
            expand: Conv2dConfig::new([reduced, channels], [1, 1]).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = self.pool.forward(x.clone());
        let scale = silu(self.reduce.forward(scale));
        let scale = sigmoid(self.expand.forward(scale));
        // [N, C, 1, 1] を空間方向にブロードキャスト
        x * scale
    }
}

/// MBConv（inverted residual）ブロック
#[derive(Module, Debug)]
pub struct MbConvBlock<B: Backend> {
    expand: Option<ConvBn<B>>,
    depthwise: ConvBn<B>,
    se: SqueezeExcite<B>,
    project: ConvBn<B>,
}

impl<B: Backend> MbConvBlock<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        kernel: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
        let reduced = ((in_channels as f64 * SE_RATIO) as usize).max(1);

        Self {
            expand: (expand_ratio != 1)
                .then(|| ConvBn::new([in_channels, hidden], 1, 1, 1, device)),
            depthwise: ConvBn::new([hidden, hidden], kernel, stride, hidden, device),
            se: SqueezeExcite::new(hidden, reduced, device),
            project: ConvBn::new([hidden, out_channels], 1, 1, 1, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => silu(expand.forward(input.clone())),
            None => input.clone(),
        };
        let x = silu(self.depthwise.forward(x));
        let x = self.se.forward(x);
        let x = self.project.forward(x);

        // stride 1 かつ入出力チャネルが同じ場合のみ残差接続
        if x.dims() == input.dims() {
            x + input
        } else {
            x
        }
    }
}

/// EfficientNet-B0 バックボーン
#[derive(Module, Debug)]
pub struct EfficientNetB0<B: Backend> {
    stem: ConvBn<B>,
    blocks: Vec<MbConvBlock<B>>,
    head: ConvBn<B>,
}

impl<B: Backend> EfficientNetB0<B> {
    /// ランダム初期化
    pub fn new(device: &B::Device) -> Self {
        let mut blocks = Vec::with_capacity(NUM_BLOCKS);
        let mut in_channels = STEM_CHANNELS;

        for (expand_ratio, kernel, stride, out_channels, repeats) in STAGES {
            for i in 0..repeats {
                // ステージ先頭のブロックのみストライドを適用
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(MbConvBlock::new(
                    in_channels,
                    out_channels,
                    expand_ratio,
                    kernel,
                    stride,
                    device,
                ));
                in_channels = out_channels;
            }
        }

        Self {
            stem: ConvBn::new([3, STEM_CHANNELS], 3, 2, 1, device),
            blocks,
            head: ConvBn::new([in_channels, FEATURE_CHANNELS], 1, 1, 1, device),
        }
    }

    /// 全ユニットを通す（凍結なし）
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward_units(images, 0..NUM_UNITS)
    }

    /// 指定範囲のユニットだけを順に通す
    pub(crate) fn forward_units(&self, images: Tensor<B, 4>, units: Range<usize>) -> Tensor<B, 4> {
        units.fold(images, |x, unit| self.forward_unit(unit, x))
    }

    fn forward_unit(&self, unit: usize, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match unit {
            0 => silu(self.stem.forward(x)),
            u if u == NUM_UNITS - 1 => silu(self.head.forward(x)),
            u => self.blocks[u - 1].forward(x),
        }
    }
}

impl<B: AutodiffBackend> EfficientNetB0<B> {
    /// 先頭 `frozen_units` 個のユニットを凍結して順伝播
    ///
    /// 凍結部分は勾配を追跡しない内部バックエンド上で推論モードとして実行するため、
    /// パラメータに勾配が流れず、BatchNorm の移動統計も更新されません。
    pub fn forward_frozen(&self, images: Tensor<B, 4>, frozen_units: usize) -> Tensor<B, 4> {
        let frozen_units = frozen_units.min(NUM_UNITS);
        if frozen_units == 0 {
            return self.forward(images);
        }

        let features = self
            .valid()
            .forward_units(images.inner(), 0..frozen_units);
        self.forward_units(Tensor::from_inner(features), frozen_units..NUM_UNITS)
    }
}
